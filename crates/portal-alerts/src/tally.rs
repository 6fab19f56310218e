use crate::notifier::MessageHandle;
use crate::report::{Damage, Report, Team};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Destroyed-resonator counts at or above this ceiling are indistinguishable
/// once rendered, and therefore also within a StateHash.
pub const RESONATOR_CEILING: u32 = 9;

/// Contribution is the share of one damage event which is merged into the
/// aggregation entry of every subscriber watching the damaged asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    /// Deterministic identity of the damage event. Contributions with an
    /// already-absorbed fingerprint add nothing to an entry.
    pub fingerprint: String,
    pub attacker: String,
    pub resonators: u32,
    pub mods: u32,
    pub links: u32,
    pub neutralized: bool,
}

impl Contribution {
    /// Build the Contribution of the `index`th damage of a Report.
    /// Returns None if the damage does not resolve against the Report.
    pub fn from_damage(report: &Report, index: usize, damage: &Damage) -> Option<Self> {
        let (asset, attacker) = report.resolve(damage)?;
        let attackee = report
            .attackers
            .get(&report.attackee)
            .map(|attackee| attackee.name.as_str())
            .unwrap_or(report.attackee.as_str());

        let identity = format!(
            "{}|{attackee}|{index}|{}|{}|{}|{}|{}",
            report.timestamp.to_rfc3339(),
            asset.key,
            attacker.name,
            damage.resonators,
            damage.mods,
            damage.links.join(","),
        );

        Some(Self {
            fingerprint: format!("{:016x}", xxhash_rust::xxh3::xxh3_64(identity.as_bytes())),
            attacker: attacker.name.clone(),
            resonators: damage.resonators,
            mods: damage.mods,
            links: damage.links.len() as u32,
            neutralized: asset.team == Team::Neutralized,
        })
    }
}

/// Tally is the running damage of one asset, as seen by one subscriber.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tally {
    pub attackers: BTreeSet<String>,
    pub resonators: u32,
    pub mods: u32,
    pub links: u32,
    pub neutralized: u32,
}

impl Tally {
    pub fn absorb(&mut self, contribution: &Contribution) {
        self.attackers.insert(contribution.attacker.clone());
        self.resonators = self.resonators.saturating_add(contribution.resonators);
        self.mods = self.mods.saturating_add(contribution.mods);
        self.links = self.links.saturating_add(contribution.links);
        if contribution.neutralized {
            self.neutralized = self.neutralized.saturating_add(1);
        }
    }

    /// Content hash of everything a rendering of this Tally can show.
    pub fn state_hash(&self) -> StateHash {
        let canonical = format!(
            "{},{},{},{},{}",
            self.resonators.min(RESONATOR_CEILING),
            self.mods,
            self.links,
            self.neutralized,
            self.attackers.iter().map(String::as_str).collect::<Vec<_>>().join(","),
        );
        StateHash(format!(
            "{:016x}",
            xxhash_rust::xxh3::xxh3_64(canonical.as_bytes())
        ))
    }
}

/// StateHash identifies the rendered state of a delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StateHash(pub String);

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// AggregationEntry is the stored state of one (asset, subscriber) pair.
///
/// `merge` is the reference semantics of the atomic merge operation which
/// every AggregationStore must apply as a single indivisible step.
#[derive(Debug, Clone)]
pub struct AggregationEntry {
    pub tally: Tally,
    /// Fingerprints of contributions absorbed within the current window.
    pub seen: BTreeSet<String>,
    pub state_hash: Option<StateHash>,
    pub handle: Option<MessageHandle>,
    pub window_started_at: Instant,
    pub updated_at: Instant,
}

impl AggregationEntry {
    pub fn new(now: Instant) -> Self {
        Self {
            tally: Tally::default(),
            seen: BTreeSet::new(),
            state_hash: None,
            handle: None,
            window_started_at: now,
            updated_at: now,
        }
    }

    /// Whether the entry's aggregation window has lapsed at `now`.
    pub fn is_idle(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.updated_at) > window
    }

    /// Merge `contribution`, first rolling over to a new window if this entry
    /// has been idle for longer than `window`.
    pub fn merge(&mut self, contribution: &Contribution, now: Instant, window: Duration) {
        if self.is_idle(now, window) {
            *self = Self::new(now);
        }
        if self.seen.insert(contribution.fingerprint.clone()) {
            self.tally.absorb(contribution);
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn contribution(fingerprint: &str, attacker: &str, resonators: u32) -> Contribution {
        Contribution {
            fingerprint: fingerprint.to_string(),
            attacker: attacker.to_string(),
            resonators,
            mods: 0,
            links: 0,
            neutralized: false,
        }
    }

    #[test]
    fn test_contribution_from_report() {
        let report = crate::report::test::fixture();

        let first = Contribution::from_damage(&report, 0, &report.damages[0]).unwrap();
        assert_eq!(first.attacker, "raider");
        assert_eq!((first.resonators, first.mods, first.links), (3, 1, 1));
        assert!(!first.neutralized);

        let second = Contribution::from_damage(&report, 1, &report.damages[1]).unwrap();
        assert!(second.neutralized);
        assert_ne!(first.fingerprint, second.fingerprint);

        // Fingerprints are stable across decodings of the same report.
        let again = Contribution::from_damage(&report, 0, &report.damages[0]).unwrap();
        assert_eq!(first, again);

        // But differ for a different attackee's report of the same attack.
        let mut other = report.clone();
        other.attackee = "a2".to_string();
        let other = Contribution::from_damage(&other, 0, &other.damages[0]).unwrap();
        assert_ne!(first.fingerprint, other.fingerprint);
    }

    #[test]
    fn test_tally_merges_monotonically() {
        let mut tally = Tally::default();
        tally.absorb(&contribution("a", "raider", 3));
        tally.absorb(&Contribution {
            mods: 2,
            links: 1,
            neutralized: true,
            ..contribution("b", "looter", 4)
        });
        tally.absorb(&contribution("c", "raider", 0));

        assert_eq!(tally.resonators, 7);
        assert_eq!(tally.mods, 2);
        assert_eq!(tally.links, 1);
        assert_eq!(tally.neutralized, 1);
        assert_eq!(
            tally.attackers.iter().collect::<Vec<_>>(),
            vec!["looter", "raider"]
        );
    }

    #[test]
    fn test_state_hash_caps_resonators() {
        let tally = |resonators| Tally {
            resonators,
            ..Tally::default()
        };
        assert_eq!(tally(9).state_hash(), tally(15).state_hash());
        assert_ne!(tally(8).state_hash(), tally(9).state_hash());

        let mut named = tally(2);
        let before = named.state_hash();
        named.attackers.insert("raider".to_string());
        assert_ne!(before, named.state_hash());
    }

    #[test]
    fn test_entry_ignores_seen_fingerprints() {
        let now = Instant::now();
        let window = Duration::from_secs(60);
        let mut entry = AggregationEntry::new(now);

        entry.merge(&contribution("a", "raider", 3), now, window);
        entry.merge(&contribution("a", "raider", 3), now, window);
        assert_eq!(entry.tally.resonators, 3);

        entry.merge(&contribution("b", "raider", 3), now, window);
        assert_eq!(entry.tally.resonators, 6);
    }

    #[test]
    fn test_entry_rolls_over_idle_windows() {
        let start = Instant::now();
        let window = Duration::from_secs(60);
        let mut entry = AggregationEntry::new(start);

        entry.merge(&contribution("a", "raider", 3), start, window);
        entry.state_hash = Some(entry.tally.state_hash());
        entry.handle = Some(MessageHandle::new("42"));

        // Activity within the window extends it.
        let later = start + Duration::from_secs(50);
        entry.merge(&contribution("b", "raider", 1), later, window);
        assert_eq!(entry.tally.resonators, 4);
        assert!(entry.handle.is_some());

        // An idle gap longer than the window starts afresh, forgetting
        // the delivered notification as well.
        let much_later = later + Duration::from_secs(61);
        entry.merge(&contribution("a", "raider", 3), much_later, window);
        assert_eq!(entry.tally.resonators, 3);
        assert_eq!(entry.handle, None);
        assert_eq!(entry.state_hash, None);
        assert_eq!(entry.window_started_at, much_later);
    }
}
