//! Description similarity between two cleaned movement descriptions.
//!
//! Used to rank manual-review candidates; never consulted when accepting
//! automatic matches.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::normalize::ComparisonRecord;

const TOKEN_WEIGHT: f64 = 0.4;
const SEQUENCE_WEIGHT: f64 = 0.4;
const KEYWORD_WEIGHT: f64 = 0.2;

static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3,}\b").expect("static regex"));
static CODES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,}\d+\b").expect("static regex"));

/// Blended score in `0.0..=1.0`: token overlap (40%), character sequence
/// ratio (40%), and shared reference numbers or codes (20%).
pub fn description_similarity(a: &ComparisonRecord, b: &ComparisonRecord) -> f64 {
    if a.description.is_empty() || b.description.is_empty() {
        return 0.0;
    }

    let overlap = token_overlap(&a.tokens, &b.tokens);
    let sequence = sequence_ratio(&a.description, &b.description);
    let shared = shared_keywords(&a.description, &b.description).len() as f64;
    let keyword = shared / a.tokens.len().max(b.tokens.len()).max(1) as f64;

    (overlap * TOKEN_WEIGHT + sequence * SEQUENCE_WEIGHT + keyword * KEYWORD_WEIGHT).min(1.0)
}

/// Jaccard index of two token sets; 0 when either is empty.
pub fn token_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let common = a.intersection(b).count();
    let union = a.union(b).count();
    common as f64 / union as f64
}

/// Long digit runs and letter+digit codes present in both descriptions.
pub fn shared_keywords(a: &str, b: &str) -> BTreeSet<String> {
    let (a, b) = (a.to_uppercase(), b.to_uppercase());
    let grab = |re: &Regex, text: &str| -> BTreeSet<String> {
        re.find_iter(text).map(|m| m.as_str().to_string()).collect()
    };

    let numbers = &grab(&NUMBERS, &a) & &grab(&NUMBERS, &b);
    let codes = &grab(&CODES, &a) & &grab(&CODES, &b);
    &numbers | &codes
}

/// Ratcliff/Obershelp ratio: `2 * M / T` where `M` counts characters in the
/// recursively found longest common blocks and `T` is the combined length.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (i, j, k) = longest_common_block(a, b);
    if k == 0 {
        return 0;
    }
    k + matching_chars(&a[..i], &b[..j]) + matching_chars(&a[i + k..], &b[j + k..])
}

// Earliest (in `a`, then `b`) among the longest blocks.
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for i in 0..a.len() {
        for j in 0..b.len() {
            curr[j + 1] = if a[i] == b[j] { prev[j] + 1 } else { 0 };
            let k = curr[j + 1];
            if k > best.2 {
                best = (i + 1 - k, j + 1 - k, k);
            }
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suggestion {
    pub movement_id: i64,
    pub score: f64,
}

/// Scores every record in `pool` against `target`, best first. Equal scores
/// keep pool order.
pub fn rank_candidates(target: &ComparisonRecord, pool: &[ComparisonRecord]) -> Vec<Suggestion> {
    let mut out: Vec<Suggestion> = pool
        .iter()
        .filter(|r| r.movement_id != target.movement_id)
        .map(|r| Suggestion {
            movement_id: r.movement_id,
            score: description_similarity(target, r),
        })
        .collect();
    out.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap_or(Ordering::Equal));
    out
}
