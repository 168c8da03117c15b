//! Checkout suggestions for double-out games.
//!
//! A checkout is a sequence of at most three darts whose values add up to
//! the remaining score and whose last dart is a double (the bullseye counts
//! as a double).

use serde::{Serialize, Serializer};
use std::fmt;

/// Highest score that can be checked out with three darts.
pub const MAX_CHECKOUT_SCORE: i32 = 170;
/// Upper bound on the number of suggestions returned.
pub const MAX_SUGGESTIONS: usize = 20;

/// One scoring segment of the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Single(u8),
    Double(u8),
    Triple(u8),
    OuterBull,
    Bullseye,
}

impl Segment {
    pub fn value(self) -> i32 {
        match self {
            Segment::Single(n) => n as i32,
            Segment::Double(n) => 2 * n as i32,
            Segment::Triple(n) => 3 * n as i32,
            Segment::OuterBull => 25,
            Segment::Bullseye => 50,
        }
    }

    pub fn is_finisher(self) -> bool {
        matches!(self, Segment::Double(_) | Segment::Bullseye)
    }

    /// Ordering among equal values: trebles, then doubles, then singles.
    fn kind_rank(self) -> u8 {
        match self {
            Segment::Triple(_) => 0,
            Segment::Double(_) | Segment::Bullseye => 1,
            Segment::Single(_) | Segment::OuterBull => 2,
        }
    }

    /// Every segment, singles then doubles then trebles then bulls.
    pub fn all() -> Vec<Segment> {
        let mut segments = Vec::with_capacity(62);
        segments.extend((1..=20).map(Segment::Single));
        segments.extend((1..=20).map(Segment::Double));
        segments.extend((1..=20).map(Segment::Triple));
        segments.push(Segment::OuterBull);
        segments.push(Segment::Bullseye);
        segments
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Single(n) => write!(f, "S{}", n),
            Segment::Double(n) => write!(f, "D{}", n),
            Segment::Triple(n) => write!(f, "T{}", n),
            Segment::OuterBull => f.write_str("SB"),
            Segment::Bullseye => f.write_str("DB"),
        }
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Checkout routes for `score` using at most `max_darts` darts.
///
/// Shorter routes come first; within a length, higher-scoring set-up darts
/// come first. Scores outside `2..=170` have no checkout.
pub fn suggest_checkout(score: i32, max_darts: u32) -> Vec<Vec<Segment>> {
    if !(2..=MAX_CHECKOUT_SCORE).contains(&score) || max_darts == 0 {
        return Vec::new();
    }

    let mut setup = Segment::all();
    setup.sort_by_key(|s| (-s.value(), s.kind_rank(), s.to_string()));
    let mut finishers: Vec<Segment> = Segment::all()
        .into_iter()
        .filter(|s| s.is_finisher())
        .collect();
    finishers.sort_by_key(|s| -s.value());

    let mut routes = Vec::new();
    routes.extend(finishing(&finishers, score).map(|last| vec![last]));
    if max_darts >= 2 {
        for &first in &setup {
            let remaining = score - first.value();
            if remaining >= 2 {
                routes.extend(finishing(&finishers, remaining).map(|last| vec![first, last]));
            }
            if routes.len() >= MAX_SUGGESTIONS {
                break;
            }
        }
    }
    if max_darts >= 3 && routes.len() < MAX_SUGGESTIONS {
        'outer: for &first in &setup {
            for &second in &setup {
                let remaining = score - first.value() - second.value();
                if remaining >= 2 {
                    routes.extend(
                        finishing(&finishers, remaining).map(|last| vec![first, second, last]),
                    );
                }
                if routes.len() >= MAX_SUGGESTIONS {
                    break 'outer;
                }
            }
        }
    }
    routes.truncate(MAX_SUGGESTIONS);
    routes
}

fn finishing(finishers: &[Segment], remaining: i32) -> impl Iterator<Item = Segment> + '_ {
    finishers
        .iter()
        .copied()
        .filter(move |segment| segment.value() == remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(routes: &[Vec<Segment>]) -> Vec<Vec<String>> {
        routes
            .iter()
            .map(|route| route.iter().map(ToString::to_string).collect())
            .collect()
    }

    #[test]
    fn one_seventy_has_the_classic_finish() {
        let routes = labels(&suggest_checkout(170, 3));
        assert!(routes.contains(&vec!["T20".to_string(), "T20".to_string(), "DB".to_string()]));
    }

    #[test]
    fn forty_finishes_with_a_single_dart_first() {
        let routes = labels(&suggest_checkout(40, 3));
        assert_eq!(routes[0], vec!["D20".to_string()]);
    }

    #[test]
    fn unfinishable_scores_have_no_routes() {
        assert!(suggest_checkout(169, 3).is_empty());
        assert!(suggest_checkout(171, 3).is_empty());
        assert!(suggest_checkout(1, 3).is_empty());
        assert!(suggest_checkout(-4, 3).is_empty());
        assert!(suggest_checkout(40, 0).is_empty());
    }

    #[test]
    fn dart_limit_is_respected() {
        assert!(suggest_checkout(100, 1).is_empty());
        let routes = suggest_checkout(100, 2);
        assert!(!routes.is_empty());
        assert!(routes.iter().all(|route| route.len() <= 2));
    }

    #[test]
    fn every_route_adds_up_and_ends_on_a_double() {
        for score in [2, 3, 41, 99, 121, 160, 170] {
            let routes = suggest_checkout(score, 3);
            assert!(!routes.is_empty(), "score {}", score);
            assert!(routes.len() <= MAX_SUGGESTIONS);
            for route in &routes {
                assert_eq!(route.iter().map(|s| s.value()).sum::<i32>(), score);
                assert!(route.last().is_some_and(|s| s.is_finisher()));
            }
        }
    }

    #[test]
    fn segments_serialize_as_labels() -> anyhow::Result<()> {
        let json = serde_json::to_string(&vec![Segment::Triple(20), Segment::OuterBull])?;
        assert_eq!(json, r#"["T20","SB"]"#);
        Ok(())
    }
}
