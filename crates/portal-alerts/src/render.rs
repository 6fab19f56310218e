use crate::tally::{Tally, RESONATOR_CEILING};
use std::fmt;

/// Count of destroyed components, as displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Exact(u32),
    /// More than the contained value, displayed as "N+".
    MoreThan(u32),
}

impl Count {
    fn is_singular(&self) -> bool {
        matches!(self, Count::Exact(1))
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Exact(n) => write!(f, "{n}"),
            Count::MoreThan(n) => write!(f, "{n}+"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Resonator,
    Mod,
    Link,
}

impl Component {
    fn noun(&self) -> &'static str {
        match self {
            Component::Resonator => "resonator",
            Component::Mod => "mod",
            Component::Link => "link",
        }
    }
}

/// Destroyed is one "N components" clause of a Summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destroyed {
    pub count: Count,
    pub component: Component,
}

impl Destroyed {
    /// Noun of the clause, pluralized to agree with its count.
    pub fn noun(&self) -> String {
        let noun = self.component.noun();
        if self.count.is_singular() {
            noun.to_string()
        } else {
            format!("{noun}s")
        }
    }
}

impl fmt::Display for Destroyed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.count, self.noun())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neutralized {
    Never,
    Once,
    Times(u32),
}

impl fmt::Display for Neutralized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Neutralized::Never => Ok(()),
            Neutralized::Once => f.write_str("neutralized"),
            Neutralized::Times(n) => write!(f, "neutralized {n} times"),
        }
    }
}

/// Summary is the markup-free content of a notification about a Tally.
/// Notifiers decorate its fields with their own markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Distinct attacker names, in sorted order.
    pub attackers: Vec<String>,
    /// Non-empty destruction clauses, in the order resonators, mods, links.
    pub destroyed: Vec<Destroyed>,
    pub neutralized: Neutralized,
}

impl Summary {
    pub fn from_tally(tally: &Tally) -> Self {
        let mut destroyed = Vec::new();

        let resonators = if tally.resonators >= RESONATOR_CEILING {
            Some(Count::MoreThan(RESONATOR_CEILING - 1))
        } else if tally.resonators > 0 {
            Some(Count::Exact(tally.resonators))
        } else {
            None
        };
        let others = [(tally.mods, Component::Mod), (tally.links, Component::Link)];

        destroyed.extend(resonators.map(|count| Destroyed {
            count,
            component: Component::Resonator,
        }));
        destroyed.extend(others.into_iter().filter(|(n, _)| *n > 0).map(
            |(n, component)| Destroyed {
                count: Count::Exact(n),
                component,
            },
        ));

        let neutralized = match tally.neutralized {
            0 => Neutralized::Never,
            1 => Neutralized::Once,
            n => Neutralized::Times(n),
        };

        Self {
            attackers: tally.attackers.iter().cloned().collect(),
            destroyed,
            neutralized,
        }
    }

    /// Render as plain text lines.
    pub fn to_text(&self) -> String {
        let mut lines = vec![format!("attacked by {}", self.attackers.join(", "))];

        if !self.destroyed.is_empty() {
            let clauses: Vec<String> = self.destroyed.iter().map(ToString::to_string).collect();
            lines.push(format!("{} destroyed", clauses.join(", ")));
        }
        if self.neutralized != Neutralized::Never {
            lines.push(self.neutralized.to_string());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tally(resonators: u32, mods: u32, links: u32, neutralized: u32) -> Tally {
        Tally {
            attackers: ["raider", "looter"].into_iter().map(String::from).collect(),
            resonators,
            mods,
            links,
            neutralized,
        }
    }

    #[test]
    fn test_resonators_are_capped() {
        let text = |n| Summary::from_tally(&tally(n, 0, 0, 0)).to_text();

        assert_eq!(text(9), text(15));
        insta::assert_snapshot!(text(9), @r###"
        attacked by looter, raider
        8+ resonators destroyed
        "###);
        insta::assert_snapshot!(text(8), @r###"
        attacked by looter, raider
        8 resonators destroyed
        "###);
        insta::assert_snapshot!(text(1), @r###"
        attacked by looter, raider
        1 resonator destroyed
        "###);
        insta::assert_snapshot!(text(0), @"attacked by looter, raider");
    }

    #[test]
    fn test_mods_and_links_pluralize() {
        let summary = Summary::from_tally(&tally(2, 1, 3, 0));
        assert_eq!(
            summary.destroyed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["2 resonators", "1 mod", "3 links"],
        );

        let summary = Summary::from_tally(&tally(0, 2, 1, 0));
        assert_eq!(
            summary.destroyed.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["2 mods", "1 link"],
        );
    }

    #[test]
    fn test_neutralization_wording() {
        let text = |n| Summary::from_tally(&tally(4, 0, 0, n)).to_text();

        assert!(!text(0).contains("neutralized"));
        insta::assert_snapshot!(text(1), @r###"
        attacked by looter, raider
        4 resonators destroyed
        neutralized
        "###);
        assert!(text(3).ends_with("\nneutralized 3 times"));
    }
}
