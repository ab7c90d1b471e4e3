use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

use crate::normalize::{ComparisonRecord, ValueBucket};

/// Widest date gap accepted by the approximate pass.
pub const APPROXIMATE_WINDOW_DAYS: i64 = 2;

/// One bank/auxiliary pair sharing a join key, before 1:1 resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Position in the join output; the "natural order" tie-breaks rely on.
    pub seq: usize,
    pub bank_id: i64,
    pub aux_id: i64,
    pub day_distance: Option<i64>,
}

/// An accepted 1:1 pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pairing {
    pub bank_movement_id: i64,
    pub aux_movement_id: i64,
    /// 0 for exact pairings, day distance for approximate ones.
    pub difference: i64,
}

/// Picks one candidate out of several that compete for the same movement.
///
/// `candidates` is never empty and is given in join order.
pub trait TieBreak {
    fn choose_best(&self, candidates: &[Candidate]) -> usize;
}

/// Keeps whichever candidate the join produced first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstSeen;

impl TieBreak for FirstSeen {
    fn choose_best(&self, _candidates: &[Candidate]) -> usize {
        0
    }
}

/// Prefers the smallest date gap; earliest candidate wins ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosestDate;

impl TieBreak for ClosestDate {
    fn choose_best(&self, candidates: &[Candidate]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (c.day_distance.unwrap_or(i64::MAX), *i))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// Config-selectable tie-break.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakStrategy {
    #[default]
    FirstSeen,
    ClosestDate,
}

impl TieBreak for TieBreakStrategy {
    fn choose_best(&self, candidates: &[Candidate]) -> usize {
        match self {
            TieBreakStrategy::FirstSeen => FirstSeen.choose_best(candidates),
            TieBreakStrategy::ClosestDate => ClosestDate.choose_best(candidates),
        }
    }
}

/// Pairs records agreeing on rounded value, day of month, and value bucket.
///
/// Records without a valid date are left out: their day of month is unknown.
pub fn exact_matches(
    bank: &[ComparisonRecord],
    aux: &[ComparisonRecord],
    tie_break: &dyn TieBreak,
) -> Vec<Pairing> {
    let key = |r: &ComparisonRecord| -> Option<(Decimal, u32, ValueBucket)> {
        Some((r.value, r.day_of_month()?, r.bucket))
    };
    let candidates = hash_join(bank, aux, key);
    resolve_one_to_one(candidates, tie_break)
        .into_iter()
        .map(|c| Pairing {
            bank_movement_id: c.bank_id,
            aux_movement_id: c.aux_id,
            difference: 0,
        })
        .collect()
}

/// Pairs records agreeing on rounded value and bucket whose dates are at most
/// [`APPROXIMATE_WINDOW_DAYS`] apart. Undated records never take part.
pub fn approximate_matches(
    bank: &[ComparisonRecord],
    aux: &[ComparisonRecord],
    tie_break: &dyn TieBreak,
) -> Vec<Pairing> {
    let key = |r: &ComparisonRecord| -> Option<(Decimal, ValueBucket)> {
        r.date?;
        Some((r.value, r.bucket))
    };
    let candidates: Vec<Candidate> = hash_join(bank, aux, key)
        .into_iter()
        .filter(|c| matches!(c.day_distance, Some(days) if days <= APPROXIMATE_WINDOW_DAYS))
        .collect();

    resolve_one_to_one(candidates, tie_break)
        .into_iter()
        .map(|c| Pairing {
            bank_movement_id: c.bank_id,
            aux_movement_id: c.aux_id,
            difference: c.day_distance.unwrap_or_default(),
        })
        .collect()
}

/// Inner join on `key`, emitted bank-major in input order.
fn hash_join<K, F>(bank: &[ComparisonRecord], aux: &[ComparisonRecord], key: F) -> Vec<Candidate>
where
    K: Eq + Hash,
    F: Fn(&ComparisonRecord) -> Option<K>,
{
    let mut by_key: HashMap<K, Vec<&ComparisonRecord>> = HashMap::new();
    for record in aux {
        if let Some(k) = key(record) {
            by_key.entry(k).or_default().push(record);
        }
    }

    let mut out = Vec::new();
    for b in bank {
        let Some(k) = key(b) else {
            continue;
        };
        let Some(matches) = by_key.get(&k) else {
            continue;
        };
        for a in matches {
            out.push(Candidate {
                seq: out.len(),
                bank_id: b.movement_id,
                aux_id: a.movement_id,
                day_distance: b.day_distance(a),
            });
        }
    }
    out
}

/// Reduces a candidate list to 1:1 pairs: one survivor per bank movement,
/// then one survivor per auxiliary movement among those. Join order is kept.
pub fn resolve_one_to_one(candidates: Vec<Candidate>, tie_break: &dyn TieBreak) -> Vec<Candidate> {
    let per_bank = keep_one_per(candidates, |c| c.bank_id, tie_break);
    keep_one_per(per_bank, |c| c.aux_id, tie_break)
}

fn keep_one_per(
    candidates: Vec<Candidate>,
    id_of: impl Fn(&Candidate) -> i64,
    tie_break: &dyn TieBreak,
) -> Vec<Candidate> {
    let mut groups: Vec<Vec<Candidate>> = Vec::new();
    let mut index: HashMap<i64, usize> = HashMap::new();
    for c in candidates {
        let slot = *index.entry(id_of(&c)).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(c);
    }

    let mut kept: Vec<Candidate> = groups
        .into_iter()
        .map(|group| {
            let pick = tie_break.choose_best(&group).min(group.len() - 1);
            group[pick]
        })
        .collect();
    kept.sort_by_key(|c| c.seq);
    kept
}
