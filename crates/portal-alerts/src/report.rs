use crate::keys::AssetKey;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Report is a parsed and verified attack report.
///
/// `damages` reference entries of `assets` and `attackers` by their
/// report-local identifiers.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    /// Identifier (within `attackers`) of the agent who received this report.
    pub attackee: String,
    pub damages: Vec<Damage>,
    #[serde(rename = "portals")]
    pub assets: BTreeMap<String, Asset>,
    #[serde(rename = "agents")]
    pub attackers: BTreeMap<String, Attacker>,
}

/// Asset is a named, geolocated point which may be attacked and watched.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(from = "AssetRepr")]
pub struct Asset {
    pub name: String,
    pub address: String,
    pub image: Option<String>,
    pub key: AssetKey,
    pub team: Team,
    /// Resonators remaining on the asset after the attack, when known.
    pub resonators: Option<u32>,
}

#[derive(serde::Deserialize)]
struct AssetRepr {
    name: String,
    address: String,
    #[serde(default)]
    image: Option<String>,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    team: Team,
    #[serde(default)]
    resonators: Option<u32>,
}

impl From<AssetRepr> for Asset {
    fn from(repr: AssetRepr) -> Self {
        let AssetRepr {
            name,
            address,
            image,
            latitude,
            longitude,
            team,
            resonators,
        } = repr;

        Asset {
            name,
            address,
            image,
            key: AssetKey::from_degrees(latitude, longitude),
            team,
            resonators,
        }
    }
}

impl Asset {
    /// City component of the postal address, such as "Paris" for
    /// "5 Avenue Anatole France, 75007 Paris, France".
    pub fn city(&self) -> &str {
        let parts: Vec<&str> = self.address.split(", ").collect();
        if parts.len() < 2 {
            return "";
        }
        let locality = parts[parts.len() - 2];

        // Drop a leading postal code.
        match locality.split_once(' ') {
            Some((code, city)) if code.contains(|c: char| c.is_ascii_digit()) => city,
            _ => locality,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Enlightened,
    Resistance,
    Machina,
    Neutralized,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Attacker {
    pub name: String,
    #[serde(default)]
    pub team: Team,
}

/// Damage is one attacker's destruction on one asset.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct Damage {
    #[serde(rename = "portal")]
    pub asset: String,
    pub attacker: String,
    #[serde(default)]
    pub resonators: u32,
    #[serde(default)]
    pub mods: u32,
    /// Report-local identifiers of the assets at the far end of destroyed links.
    #[serde(default)]
    pub links: Vec<String>,
}

impl Report {
    /// Verify that all references of the Report resolve.
    pub fn validate(&self) -> Result<(), String> {
        if self.damages.is_empty() {
            return Err("report has no damages".to_string());
        }
        if !self.attackers.contains_key(&self.attackee) {
            return Err(format!("attackee {:?} is not a known agent", self.attackee));
        }
        for (index, damage) in self.damages.iter().enumerate() {
            if !self.assets.contains_key(&damage.asset) {
                return Err(format!(
                    "damage {index} references unknown portal {:?}",
                    damage.asset
                ));
            }
            if !self.attackers.contains_key(&damage.attacker) {
                return Err(format!(
                    "damage {index} references unknown agent {:?}",
                    damage.attacker
                ));
            }
        }
        Ok(())
    }

    /// Resolve the Asset and Attacker of a Damage.
    /// Returns None if the Report was not validated and a reference dangles.
    pub fn resolve(&self, damage: &Damage) -> Option<(&Asset, &Attacker)> {
        Some((
            self.assets.get(&damage.asset)?,
            self.attackers.get(&damage.attacker)?,
        ))
    }

    /// Re-attribute link-only damages which name the wrong end of the link.
    ///
    /// Reports list a destroyed link against the attackee's asset even when
    /// the attack happened at the other end. When the damage destroyed only a
    /// single link, its asset is still well defended (two or more resonators),
    /// and the far end is not, the far end is where the attack happened.
    pub fn reorder_links(&mut self) {
        let assets = &self.assets;

        for damage in self.damages.iter_mut() {
            let [far] = damage.links.as_slice() else {
                continue;
            };
            if damage.resonators != 0 || damage.mods != 0 {
                continue;
            }
            let remaining = |id: &str| assets.get(id).and_then(|asset| asset.resonators);

            match (remaining(&damage.asset), remaining(far)) {
                (Some(near), Some(far_remaining)) if near >= 2 && far_remaining < 2 => {
                    let far = far.clone();
                    let near = std::mem::replace(&mut damage.asset, far);
                    damage.links = vec![near];
                }
                _ => (),
            }
        }
    }
}
