//! Bandwidth based representation selection.

use crate::{AdaptationSet, Representation};

/// Which representation of an adaptation set is played.
///
/// Ties keep the representation listed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepresentationSelectionPolicy {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    /// Smallest absolute distance to the target
    ClosestToBandwidth(u64),
    /// Highest bandwidth not above the cap, else the lowest available
    MaxBandwidth(u64),
}

impl RepresentationSelectionPolicy {
    pub fn select<'a>(&self, set: &'a AdaptationSet) -> Option<&'a Representation> {
        self.select_from(&set.representations)
    }

    pub fn select_from<'a>(&self, representations: &'a [Representation]) -> Option<&'a Representation> {
        match *self {
            Self::HighestBandwidth => first_best(representations, |r| r.bandwidth as i128),
            Self::LowestBandwidth => first_best(representations, |r| -(r.bandwidth as i128)),
            Self::ClosestToBandwidth(target) => first_best(representations, |r| {
                -(r.bandwidth as i128 - target as i128).abs()
            }),
            Self::MaxBandwidth(cap) => {
                let capped: Vec<&Representation> =
                    representations.iter().filter(|r| r.bandwidth <= cap).collect();
                match first_best(capped.iter().copied(), |r| r.bandwidth as i128) {
                    Some(rep) => Some(rep),
                    None => first_best(representations, |r| -(r.bandwidth as i128)),
                }
            }
        }
    }
}

/// Highest scoring item; the earliest wins on equal scores.
fn first_best<'a, I, F>(items: I, score: F) -> Option<&'a Representation>
where
    I: IntoIterator<Item = &'a Representation>,
    F: Fn(&Representation) -> i128,
{
    let mut best: Option<(&Representation, i128)> = None;
    for item in items {
        let s = score(item);
        match best {
            Some((_, current)) if current >= s => {}
            _ => best = Some((item, s)),
        }
    }
    best.map(|(r, _)| r)
}
