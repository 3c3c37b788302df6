use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::context::{MatchContext, Stage};
use crate::error::{MatchError, Result};
use crate::types::*;

fn cached<'c>(cache: &'c BTreeMap<String, Allele>, id: &str) -> Result<&'c Allele> {
    cache
        .get(id)
        .ok_or_else(|| MatchError::MissingAllele(id.to_string()))
}

/// Buckets each resolved haplotype into the fixed allele classes
pub struct HaplotypeClassifier;

impl HaplotypeClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::Classified)?;

        let cache = &ctx.cache;
        for individual in ctx.individuals.values_mut() {
            let mut classified: ClassifiedHaplotype = AlleleClass::ALL
                .into_iter()
                .map(|class| (class, Vec::new()))
                .collect();

            for id in &individual.haplotype {
                let class = AlleleClass::of(cached(cache, id)?)?;
                classified.entry(class).or_default().push(id.clone());
            }

            let total: usize = classified.values().map(Vec::len).sum();
            if total != individual.haplotype.len() {
                return Err(MatchError::ClassificationMismatch {
                    id: individual.id.clone(),
                    haplotype: individual.haplotype.len(),
                    classified: total,
                });
            }
            individual.classified = classified;
        }

        ctx.complete(Stage::Classified);
        info!("Classified haplotypes of {} individuals", ctx.individuals.len());
        Ok(())
    }
}

impl Default for HaplotypeClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges the aligned sequences of an individual's alleles per class
pub struct AlleleGrouper;

impl AlleleGrouper {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::Grouped)?;

        let cache = &ctx.cache;
        for individual in ctx.individuals.values_mut() {
            let mut grouped = GroupedHaplotype::new();
            for (class, ids) in &individual.classified {
                let alleles = ids
                    .iter()
                    .map(|id| cached(cache, id))
                    .collect::<Result<Vec<_>>>()?;
                grouped.insert(*class, group_alleles(&alleles));
            }
            individual.grouped = grouped;
        }

        ctx.complete(Stage::Grouped);
        info!("Grouped alleles of {} individuals", ctx.individuals.len());
        Ok(())
    }
}

impl Default for AlleleGrouper {
    fn default() -> Self {
        Self::new()
    }
}

/// One string per aligned position holding every allele's residue there,
/// in allele order. Alleles shorter than the longest contribute a gap.
pub fn group_alleles(alleles: &[&Allele]) -> GroupedSequence {
    let length = alleles.iter().map(|a| a.aligned_len()).max().unwrap_or(0);
    (1..=length)
        .map(|pos| {
            alleles
                .iter()
                .map(|allele| allele.residue_at(pos).unwrap_or(GAP))
                .collect()
        })
        .collect()
}

/// Computes per-position residue differences for every recipient/donor pair
pub struct DifferenceScorer;

impl DifferenceScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::Scored)?;

        let mut scoring = DifferenceScoring::new();
        for recipient in ctx.recipients() {
            let per_donor = scoring.entry(recipient.id.clone()).or_default();
            for donor in ctx.donors() {
                if !recipient.grouped.keys().eq(donor.grouped.keys()) {
                    return Err(MatchError::ClassKeyMismatch {
                        donor: donor.id.clone(),
                        recipient: recipient.id.clone(),
                    });
                }

                let classes = donor
                    .grouped
                    .iter()
                    .zip(recipient.grouped.values())
                    .map(|((class, donor_seq), recip_seq)| {
                        (*class, score_difference(donor_seq, recip_seq))
                    })
                    .collect();
                per_donor.insert(donor.id.clone(), classes);
            }
        }

        ctx.difference_scoring = scoring;
        ctx.complete(Stage::Scored);
        info!("Difference scores computed for all recipient and donor pairs");
        Ok(())
    }
}

impl Default for DifferenceScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare two grouped sequences position by position
pub fn score_difference(donor: &[String], recipient: &[String]) -> ClassDifference {
    let length = donor.len().max(recipient.len());
    let gap = GAP.to_string();

    let mut difference = ClassDifference {
        donor_diff: Vec::with_capacity(length),
        recip_diff: Vec::with_capacity(length),
        donor_diff_score: 0,
        recip_diff_score: 0,
        all_donor_diff_counts: Vec::with_capacity(length),
        all_donor_diff_ratios: Vec::with_capacity(length),
        all_recip_diff_counts: Vec::with_capacity(length),
        all_recip_diff_ratios: Vec::with_capacity(length),
        filtered: None,
    };

    for pos in 0..length {
        let donor_residues = donor.get(pos).unwrap_or(&gap);
        let recip_residues = recipient.get(pos).unwrap_or(&gap);

        let donor_set: BTreeSet<char> = donor_residues.chars().collect();
        let recip_set: BTreeSet<char> = recip_residues.chars().collect();
        let donor_diff: Mismatch = donor_set.difference(&recip_set).copied().collect();
        let recip_diff: Mismatch = recip_set.difference(&donor_set).copied().collect();

        if !donor_diff.is_empty() {
            difference.donor_diff_score += 1;
        }
        if !recip_diff.is_empty() {
            difference.recip_diff_score += 1;
        }

        let (counts, ratios) = residue_frequencies(donor_residues, &donor_diff);
        difference.all_donor_diff_counts.push(counts);
        difference.all_donor_diff_ratios.push(ratios);
        let (counts, ratios) = residue_frequencies(recip_residues, &recip_diff);
        difference.all_recip_diff_counts.push(counts);
        difference.all_recip_diff_ratios.push(ratios);

        difference.donor_diff.push(donor_diff);
        difference.recip_diff.push(recip_diff);
    }

    difference
}

/// Occurrences of each differing residue in the grouped string, and their share of it
fn residue_frequencies(
    residues: &str,
    differing: &[char],
) -> (BTreeMap<char, usize>, BTreeMap<char, f64>) {
    let counts: BTreeMap<char, usize> = differing
        .iter()
        .map(|residue| (*residue, residues.chars().filter(|c| c == residue).count()))
        .collect();
    let total = residues.chars().count().max(1) as f64;
    let ratios = counts
        .iter()
        .map(|(residue, count)| (*residue, *count as f64 / total))
        .collect();
    (counts, ratios)
}

/// Averages solvent accessibility per individual, class and position
pub struct SasAverager;

impl SasAverager {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::Averaged)?;

        let mut sas_scores = SasScores::new();
        for individual in ctx.individuals.values() {
            let mut per_class = BTreeMap::new();
            for (class, ids) in &individual.classified {
                let alleles = ids
                    .iter()
                    .map(|id| ctx.allele(id))
                    .collect::<Result<Vec<_>>>()?;
                per_class.insert(*class, average_accessibility(&alleles)?);
            }
            sas_scores.insert(individual.id.clone(), per_class);
        }

        ctx.sas_scores = sas_scores;
        ctx.complete(Stage::Averaged);
        info!("SAS scores averaged for {} individuals", ctx.individuals.len());
        Ok(())
    }
}

impl Default for SasAverager {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean RSA and ASA at each position over the alleles that have both values there
pub fn average_accessibility(alleles: &[&Allele]) -> Result<Vec<SasScore>> {
    let mut profiles = Vec::with_capacity(alleles.len());
    for allele in alleles {
        let rsa = allele
            .aligned_rsa
            .as_deref()
            .ok_or_else(|| MatchError::MissingAccessibility {
                allele: allele.id.clone(),
                field: "rsa",
            })?;
        let asa = allele
            .aligned_asa
            .as_deref()
            .ok_or_else(|| MatchError::MissingAccessibility {
                allele: allele.id.clone(),
                field: "asa",
            })?;
        profiles.push((rsa, asa));
    }

    let length = profiles
        .iter()
        .map(|(rsa, asa)| rsa.len().max(asa.len()))
        .max()
        .unwrap_or(0);

    let scores = (0..length)
        .map(|pos| {
            let mut rsa_sum = 0.0;
            let mut asa_sum = 0.0;
            let mut total = 0;
            for (rsa, asa) in &profiles {
                if let (Some(Some(r)), Some(Some(a))) = (rsa.get(pos), asa.get(pos)) {
                    rsa_sum += r;
                    asa_sum += a;
                    total += 1;
                }
            }
            if total == 0 {
                SasScore::default()
            } else {
                SasScore {
                    rsa: Some(rsa_sum / total as f64),
                    asa: Some(asa_sum / total as f64),
                    total,
                }
            }
        })
        .collect();

    Ok(scores)
}

/// Suppresses mismatches at buried positions
pub struct SasFilter {
    rsa_threshold: f64,
}

impl SasFilter {
    pub fn new(rsa_threshold: f64) -> Self {
        Self { rsa_threshold }
    }

    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::Filtered)?;

        let sas_scores = &ctx.sas_scores;
        let mut suppressed = 0usize;
        for (recipient_id, per_donor) in ctx.difference_scoring.iter_mut() {
            for (donor_id, classes) in per_donor.iter_mut() {
                for (class, difference) in classes.iter_mut() {
                    let donor_profile = profile(sas_scores, donor_id, *class);
                    let recip_profile = profile(sas_scores, recipient_id, *class);

                    let updated_mismatches =
                        self.filter(&difference.donor_diff, donor_profile);
                    let updated_recip_mismatches =
                        self.filter(&difference.recip_diff, recip_profile);

                    let filtered = FilteredMismatches {
                        updated_mismatches_count: count_non_empty(&updated_mismatches),
                        updated_mismatches,
                        updated_recip_mismatches_count: count_non_empty(&updated_recip_mismatches),
                        updated_recip_mismatches,
                    };
                    suppressed += difference.donor_diff_score - filtered.updated_mismatches_count;
                    suppressed +=
                        difference.recip_diff_score - filtered.updated_recip_mismatches_count;
                    difference.filtered = Some(filtered);
                }
            }
        }

        debug!("{} mismatches at buried positions suppressed", suppressed);
        ctx.rsa_threshold = Some(self.rsa_threshold);
        ctx.complete(Stage::Filtered);
        info!("Mismatches filtered at RSA threshold {}", self.rsa_threshold);
        Ok(())
    }

    /// Positions without a profile entry, or with no RSA value, are kept
    fn filter(&self, mismatches: &[Mismatch], profile: &[SasScore]) -> Vec<Mismatch> {
        mismatches
            .iter()
            .enumerate()
            .map(|(pos, mismatch)| {
                let buried = profile
                    .get(pos)
                    .and_then(|score| score.rsa)
                    .map(|rsa| rsa < self.rsa_threshold)
                    .unwrap_or(false);
                if buried {
                    Vec::new()
                } else {
                    mismatch.clone()
                }
            })
            .collect()
    }
}

fn profile<'s>(sas_scores: &'s SasScores, id: &str, class: AlleleClass) -> &'s [SasScore] {
    sas_scores
        .get(id)
        .and_then(|classes| classes.get(&class))
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn count_non_empty(mismatches: &[Mismatch]) -> usize {
    mismatches.iter().filter(|m| !m.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{fixture_store, JsonAlleleStore};
    use crate::resolver::AlleleResolver;

    fn individuals(recipient: &[&str], donors: &[(&str, &[&str])]) -> Vec<Individual> {
        let mut all = vec![Individual::new(
            "R1",
            Role::Recipient,
            recipient.iter().map(|a| a.to_string()).collect(),
        )];
        for (id, alleles) in donors {
            all.push(Individual::new(
                *id,
                Role::Donor,
                alleles.iter().map(|a| a.to_string()).collect(),
            ));
        }
        all
    }

    fn resolved(store: &JsonAlleleStore, ind: Vec<Individual>) -> MatchContext {
        let mut ctx = MatchContext::new(ind);
        AlleleResolver::new(store).run(&mut ctx).unwrap();
        ctx
    }

    fn scored(recipient: &[&str], donors: &[(&str, &[&str])]) -> MatchContext {
        let store = fixture_store();
        let mut ctx = resolved(&store, individuals(recipient, donors));
        HaplotypeClassifier::new().run(&mut ctx).unwrap();
        AlleleGrouper::new().run(&mut ctx).unwrap();
        DifferenceScorer::new().run(&mut ctx).unwrap();
        ctx
    }

    fn filtered(recipient: &[&str], donors: &[(&str, &[&str])], threshold: f64) -> MatchContext {
        let mut ctx = scored(recipient, donors);
        SasAverager::new().run(&mut ctx).unwrap();
        SasFilter::new(threshold).run(&mut ctx).unwrap();
        ctx
    }

    #[test]
    fn test_classification_partitions_haplotype() {
        let store = fixture_store();
        let mut ctx = resolved(
            &store,
            individuals(
                &["A*02:01", "DQA1*01:01", "DQB1*02:01", "DRA*01:01", "DRB1*15:01"],
                &[("D1", &["B*08:01", "A*01:01"])],
            ),
        );
        HaplotypeClassifier::new().run(&mut ctx).unwrap();

        for individual in ctx.individuals().values() {
            let total: usize = individual.classified.values().map(Vec::len).sum();
            assert_eq!(total, individual.haplotype.len());
        }
        let donor = ctx.individual("D1").unwrap();
        assert_eq!(donor.alleles_in(AlleleClass::ClassI), ["B*08:01", "A*01:01"]);
        assert!(donor.alleles_in(AlleleClass::Drb).is_empty());
        let recipient = ctx.individual("R1").unwrap();
        assert_eq!(recipient.alleles_in(AlleleClass::Dra), ["DRA*01:01"]);
    }

    #[test]
    fn test_unclassifiable_allele_aborts() {
        let store = fixture_store();
        let mut ctx = resolved(
            &store,
            individuals(&["DPB1*04:01"], &[("D1", &["A*01:01"])]),
        );
        let err = HaplotypeClassifier::new().run(&mut ctx).unwrap_err();
        assert!(matches!(err, MatchError::Unclassifiable { allele, .. } if allele == "DPB1*04:01"));
    }

    #[test]
    fn test_grouping_keeps_every_residue() {
        let ctx = scored(&["A*02:01", "A*01:01"], &[("D1", &["A*01:01"])]);
        let grouped = &ctx.individual("R1").unwrap().grouped[&AlleleClass::ClassI];
        assert_eq!(grouped.len(), 10);
        assert_eq!(grouped[0], "GG");
        assert_eq!(grouped[1], "AS");
        assert!(grouped.iter().all(|residues| residues.len() == 2));
        assert!(ctx.individual("D1").unwrap().grouped[&AlleleClass::Drb].is_empty());
    }

    #[test]
    fn test_grouping_pads_short_alleles() {
        let long = Allele {
            id: "A*01:01".to_string(),
            aligned_seq: "GSHS".to_string(),
            ..Default::default()
        };
        let short = Allele {
            id: "A*01:02".to_string(),
            aligned_seq: "GA".to_string(),
            ..Default::default()
        };
        assert_eq!(group_alleles(&[&short, &long]), vec!["GG", "AS", "-H", "-S"]);
        assert!(group_alleles(&[]).is_empty());
    }

    #[test]
    fn test_difference_scenario() {
        let ctx = scored(
            &["A*02:01"],
            &[("D1", &["A*01:01"]), ("D2", &["A*02:01"])],
        );
        let d1 = &ctx.difference_scoring()["R1"]["D1"][&AlleleClass::ClassI];
        assert_eq!(d1.donor_diff[1], vec!['S']);
        assert_eq!(d1.donor_diff[8], vec!['F']);
        assert_eq!(d1.recip_diff[1], vec!['A']);
        assert_eq!(d1.recip_diff[8], vec!['Y']);
        assert_eq!(d1.donor_diff_score, 2);
        assert_eq!(d1.recip_diff_score, 2);
        assert_eq!(d1.all_donor_diff_counts[1], BTreeMap::from([('S', 1)]));
        assert_eq!(d1.all_recip_diff_ratios[8], BTreeMap::from([('Y', 1.0)]));
        // position 1 is G on both sides
        assert!(d1.all_donor_diff_counts[0].is_empty());
        assert!(d1.all_recip_diff_ratios[0].is_empty());

        let d2 = &ctx.difference_scoring()["R1"]["D2"][&AlleleClass::ClassI];
        assert!(d2.donor_diff.iter().all(Vec::is_empty));
        assert!(d2.recip_diff.iter().all(Vec::is_empty));
        assert_eq!(d2.donor_diff_score, 0);
    }

    #[test]
    fn test_difference_with_empty_side_pads_with_gaps() {
        let difference = score_difference(&["GA".to_string(), "SS".to_string()], &[]);
        assert_eq!(difference.len(), 2);
        assert_eq!(difference.donor_diff[0], vec!['A', 'G']);
        assert_eq!(difference.recip_diff[1], vec![GAP]);
        assert_eq!(difference.all_donor_diff_ratios[0][&'G'], 0.5);
    }

    #[test]
    fn test_residue_statistics_cover_only_differing_residues() {
        let identical = score_difference(&["GA".to_string()], &["GA".to_string()]);
        assert!(identical.all_donor_diff_counts[0].is_empty());
        assert!(identical.all_donor_diff_ratios[0].is_empty());
        assert!(identical.all_recip_diff_counts[0].is_empty());

        let shared = score_difference(&["GA".to_string()], &["GG".to_string()]);
        assert_eq!(shared.donor_diff[0], vec!['A']);
        assert_eq!(shared.all_donor_diff_counts[0], BTreeMap::from([('A', 1)]));
        assert_eq!(shared.all_donor_diff_ratios[0], BTreeMap::from([('A', 0.5)]));
        assert!(shared.all_recip_diff_counts[0].is_empty());
        assert!(shared.all_recip_diff_ratios[0].is_empty());
    }

    #[test]
    fn test_class_key_mismatch_aborts() {
        let store = fixture_store();
        let mut ctx = resolved(&store, individuals(&["A*02:01"], &[("D1", &["A*01:01"])]));
        HaplotypeClassifier::new().run(&mut ctx).unwrap();
        AlleleGrouper::new().run(&mut ctx).unwrap();
        ctx.individuals
            .get_mut("D1")
            .unwrap()
            .grouped
            .remove(&AlleleClass::Dqa);

        let err = DifferenceScorer::new().run(&mut ctx).unwrap_err();
        assert!(matches!(err, MatchError::ClassKeyMismatch { .. }));
        assert!(ctx.difference_scoring().is_empty());
    }

    #[test]
    fn test_rescoring_is_idempotent() {
        let mut ctx = scored(&["A*02:01", "DRB1*15:01"], &[("D1", &["A*01:01", "DRB1*03:01"])]);
        let first = serde_json::to_string(ctx.difference_scoring()).unwrap();

        HaplotypeClassifier::new().run(&mut ctx).unwrap();
        AlleleGrouper::new().run(&mut ctx).unwrap();
        DifferenceScorer::new().run(&mut ctx).unwrap();
        assert_eq!(serde_json::to_string(ctx.difference_scoring()).unwrap(), first);
    }

    #[test]
    fn test_accessibility_skips_null_positions() {
        let mut ctx = scored(&["A*02:01", "B*08:01"], &[("D1", &["A*01:01"])]);
        SasAverager::new().run(&mut ctx).unwrap();
        let profile = &ctx.sas_scores()["R1"][&AlleleClass::ClassI];
        assert_eq!(profile.len(), 10);

        // B*08:01 has no value at position 4
        assert_eq!(profile[3].total, 1);
        assert_eq!(profile[3].rsa, Some(0.5));
        assert_eq!(profile[2].total, 2);
        assert!((profile[2].rsa.unwrap() - 0.15).abs() < 1e-9);
        assert!((profile[2].asa.unwrap() - 15.0).abs() < 1e-9);
        assert!(ctx.sas_scores()["R1"][&AlleleClass::Drb].is_empty());
    }

    #[test]
    fn test_missing_accessibility_array_aborts() {
        let mut ctx = scored(&["A*99:01"], &[("D1", &["A*01:01"])]);
        let err = SasAverager::new().run(&mut ctx).unwrap_err();
        assert!(matches!(
            err,
            MatchError::MissingAccessibility { field: "rsa", .. }
        ));
    }

    #[test]
    fn test_buried_donor_mismatch_is_suppressed() {
        let ctx = filtered(&["A*02:01"], &[("D1", &["B*08:01"])], 0.25);
        let difference = &ctx.difference_scoring()["R1"]["D1"][&AlleleClass::ClassI];
        let filtered = difference.filtered.as_ref().unwrap();

        assert_eq!(difference.donor_diff_score, 2);
        assert_eq!(filtered.updated_mismatches_count, 1);
        assert_eq!(filtered.updated_mismatches[1], vec!['S']);
        assert!(filtered.updated_mismatches[8].is_empty());
        // the recipient's own profile decides its side
        assert_eq!(filtered.updated_recip_mismatches_count, 2);
        assert_eq!(ctx.rsa_threshold(), Some(0.25));
    }

    #[test]
    fn test_high_threshold_suppresses_everything() {
        let ctx = filtered(&["A*02:01"], &[("D1", &["A*01:01"])], 0.95);
        let difference = &ctx.difference_scoring()["R1"]["D1"][&AlleleClass::ClassI];
        let filtered = difference.filtered.as_ref().unwrap();

        assert!(filtered.updated_mismatches.iter().all(Vec::is_empty));
        assert_eq!(filtered.updated_mismatches_count, 0);
        assert_eq!(difference.donor_diff_score, 2);
        assert_eq!(difference.donor_diff[1], vec!['S']);
    }

    #[test]
    fn test_filtering_never_adds_mismatches() {
        let ctx = filtered(
            &["A*02:01", "DQB1*02:01", "DRB1*15:01"],
            &[
                ("D1", &["A*01:01", "DQB1*06:02", "DRB1*03:01"]),
                ("D2", &["B*08:01", "DQB1*02:01"]),
            ],
            0.3,
        );
        for per_donor in ctx.difference_scoring().values() {
            for classes in per_donor.values() {
                for difference in classes.values() {
                    let filtered = difference.filtered.as_ref().unwrap();
                    assert!(filtered.updated_mismatches_count <= difference.donor_diff_score);
                    assert!(
                        filtered.updated_recip_mismatches_count <= difference.recip_diff_score
                    );
                }
            }
        }
    }

    #[test]
    fn test_filter_requires_averaging() {
        let mut ctx = scored(&["A*02:01"], &[("D1", &["A*01:01"])]);
        assert!(matches!(
            SasFilter::new(0.25).run(&mut ctx),
            Err(MatchError::StageOrder { .. })
        ));
    }
}
