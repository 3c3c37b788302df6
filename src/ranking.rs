use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::context::{MatchContext, Stage};
use crate::error::{MatchError, Result};
use crate::types::*;

/// How well one donor matches a recipient in one class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankingEntry {
    pub donor_id: String,
    /// Percentage of positions without a raw donor mismatch
    pub score: Option<f64>,
    /// Same, after accessibility filtering
    pub updated_score: Option<f64>,
    pub mismatches_donor: usize,
    pub mismatches_recip: usize,
    pub updated_mismatches_donor: usize,
    pub updated_mismatches_recip: usize,
    pub total_sequence_length: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecipientRanking {
    pub recipient_id: String,
    pub scores: BTreeMap<AlleleClass, Vec<RankingEntry>>,
}

/// Rank every donor for every recipient within each relevant class.
///
/// Scores are relative to the recipient's grouped length in the class and
/// undefined when the recipient has no allele there. Donors are ordered by
/// filtered score, best first.
pub fn rank(ctx: &MatchContext) -> Result<BTreeMap<String, RecipientRanking>> {
    if ctx.stage() < Stage::Filtered {
        return Err(MatchError::StageOrder {
            requested: "ranking",
            required: Stage::Filtered.name(),
        });
    }

    let classes = ctx.relevant_classes();
    let mut rankings = BTreeMap::new();

    for recipient in ctx.recipients() {
        let mut ranking = RecipientRanking {
            recipient_id: recipient.id.clone(),
            scores: BTreeMap::new(),
        };

        for class in &classes {
            let length = recipient
                .grouped
                .get(class)
                .map(Vec::len)
                .unwrap_or_default();

            let mut entries = Vec::new();
            for donor in ctx.donors() {
                let difference = ctx
                    .difference_scoring()
                    .get(&recipient.id)
                    .and_then(|donors| donors.get(&donor.id))
                    .and_then(|classes| classes.get(class))
                    .ok_or_else(|| MatchError::ClassKeyMismatch {
                        donor: donor.id.clone(),
                        recipient: recipient.id.clone(),
                    })?;
                entries.push(entry(&donor.id, difference, length));
            }

            entries.sort_by(compare_entries);
            ranking.scores.insert(*class, entries);
        }

        rankings.insert(recipient.id.clone(), ranking);
    }

    Ok(rankings)
}

fn entry(donor_id: &str, difference: &ClassDifference, length: usize) -> RankingEntry {
    let (updated_donor, updated_recip) = difference
        .filtered
        .as_ref()
        .map(|f| (f.updated_mismatches_count, f.updated_recip_mismatches_count))
        .unwrap_or((difference.donor_diff_score, difference.recip_diff_score));

    RankingEntry {
        donor_id: donor_id.to_string(),
        score: match_percentage(difference.donor_diff_score, length),
        updated_score: match_percentage(updated_donor, length),
        mismatches_donor: difference.donor_diff_score,
        mismatches_recip: difference.recip_diff_score,
        updated_mismatches_donor: updated_donor,
        updated_mismatches_recip: updated_recip,
        total_sequence_length: difference.len(),
    }
}

/// `100 - round(mismatches / length, 4) * 100`
pub fn match_percentage(mismatches: usize, length: usize) -> Option<f64> {
    if length == 0 {
        return None;
    }
    let fraction = mismatches as f64 / length as f64;
    let rounded = (fraction * 10_000.0).round() / 10_000.0;
    Some(100.0 - rounded * 100.0)
}

fn compare_entries(a: &RankingEntry, b: &RankingEntry) -> Ordering {
    match (a.updated_score, b.updated_score) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.donor_id.cmp(&b.donor_id))
}
