use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::analysis::{AlleleGrouper, DifferenceScorer, HaplotypeClassifier, SasAverager, SasFilter};
use crate::context::MatchContext;
use crate::database::AlleleDatabase;
use crate::eplets::EpletMatcher;
use crate::error::Result;
use crate::parsers::ParsedDataset;
use crate::ranking::{rank, RecipientRanking};
use crate::types::*;

/// Everything one matching run produces, read-only for report writers
#[derive(Debug, Clone, Serialize)]
pub struct MatchResults {
    pub dataset: String,
    pub rsa_threshold: f64,
    pub individuals: BTreeMap<String, Individual>,
    pub audit: AlleleAudit,
    pub relevant_classes: Vec<AlleleClass>,
    pub difference_scoring: DifferenceScoring,
    pub sas_scores: SasScores,
    pub eplets_found: EpletsFound,
    pub ranking: BTreeMap<String, RecipientRanking>,
    /// Resolved allele id -> aligned sequence
    pub alignment: BTreeMap<String, String>,
}

impl MatchResults {
    pub fn donors(&self) -> impl Iterator<Item = &Individual> {
        self.individuals.values().filter(|i| i.role == Role::Donor)
    }

    pub fn recipients(&self) -> impl Iterator<Item = &Individual> {
        self.individuals
            .values()
            .filter(|i| i.role == Role::Recipient)
    }

    /// Number of (recipient, donor, class) combinations with at least one known eplet
    pub fn eplet_hits(&self) -> usize {
        self.eplets_found
            .values()
            .flat_map(|donors| donors.values())
            .map(|classes| classes.len())
            .sum()
    }
}

/// Runs the full pipeline for one dataset against a shared reference store
pub struct Matchmaker<'a> {
    db: &'a dyn AlleleDatabase,
    rsa_threshold: f64,
}

impl<'a> Matchmaker<'a> {
    pub fn new(db: &'a dyn AlleleDatabase, rsa_threshold: f64) -> Self {
        Self { db, rsa_threshold }
    }

    pub fn rsa_threshold(&self) -> f64 {
        self.rsa_threshold
    }

    /// Resolve, classify, group, score, average, filter and match eplets
    pub fn run_stages(&self, ctx: &mut MatchContext) -> Result<()> {
        crate::resolver::AlleleResolver::new(self.db).run(ctx)?;
        HaplotypeClassifier::new().run(ctx)?;
        AlleleGrouper::new().run(ctx)?;
        DifferenceScorer::new().run(ctx)?;
        SasAverager::new().run(ctx)?;
        SasFilter::new(self.rsa_threshold).run(ctx)?;
        EpletMatcher::new(self.db).run(ctx)?;
        Ok(())
    }

    pub fn run(&self, dataset: ParsedDataset) -> Result<MatchResults> {
        info!(
            "Matching {} donors against {} recipients in {}",
            dataset.donor_count(),
            dataset.recipient_count(),
            dataset.name
        );

        let mut ctx = MatchContext::new(dataset.individuals);
        self.run_stages(&mut ctx)?;
        let ranking = rank(&ctx)?;

        let alignment = ctx
            .cached_alleles()
            .values()
            .map(|allele| (allele.id.clone(), allele.aligned_seq.clone()))
            .collect();
        let relevant_classes = ctx.relevant_classes();

        Ok(MatchResults {
            dataset: dataset.name,
            rsa_threshold: self.rsa_threshold,
            individuals: ctx.individuals,
            audit: ctx.audit,
            relevant_classes,
            difference_scoring: ctx.difference_scoring,
            sas_scores: ctx.sas_scores,
            eplets_found: ctx.eplets_found,
            ranking,
            alignment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixture_store;

    fn dataset(recipient: &[&str], donors: &[(&str, &[&str])]) -> ParsedDataset {
        let mut individuals = vec![Individual::new(
            "R1",
            Role::Recipient,
            recipient.iter().map(|a| a.to_string()).collect(),
        )];
        for (id, alleles) in donors {
            individuals.push(Individual::new(
                *id,
                Role::Donor,
                alleles.iter().map(|a| a.to_string()).collect(),
            ));
        }
        ParsedDataset::new("test", individuals).unwrap()
    }

    #[test]
    fn test_full_run_reports_eplets_both_ways() {
        let store = fixture_store();
        let results = Matchmaker::new(&store, 0.25)
            .run(dataset(&["A*02:01"], &[("D1", &["A*01:01"]), ("D2", &["A*02:01"])]))
            .unwrap();

        let d1 = &results.eplets_found["R1"]["D1"][&AlleleClass::ClassI];
        assert_eq!(d1.donor_diff.keys().collect::<Vec<_>>(), vec!["2S", "9F"]);
        assert_eq!(d1.recip_diff.keys().collect::<Vec<_>>(), vec!["2A9Y", "9Y"]);
        assert_eq!(d1.donor_diff["2S"].donors, vec!["A*01:01"]);
        assert_eq!(d1.donor_diff["2S"].recipients, vec!["A*02:01"]);
        assert_eq!(d1.recip_diff["2A9Y"].mismatch_position, 2);
        assert_eq!(
            (d1.recip_diff["2A9Y"].min_pos, d1.recip_diff["2A9Y"].max_pos),
            (1, 11)
        );

        // identical haplotypes: donor present with no classes
        assert!(results.eplets_found["R1"]["D2"].is_empty());
        assert_eq!(results.relevant_classes, vec![AlleleClass::ClassI]);
        assert_eq!(results.eplet_hits(), 1);
    }

    #[test]
    fn test_results_carry_alignment_and_ranking() {
        let store = fixture_store();
        let results = Matchmaker::new(&store, 0.25)
            .run(dataset(&["A*02:01"], &[("D1", &["A*01:01"]), ("D2", &["A*02:01"])]))
            .unwrap();

        assert_eq!(results.alignment["A*01:01"], "GSHSMRYFFT");
        let ranked = &results.ranking["R1"].scores[&AlleleClass::ClassI];
        assert_eq!(ranked[0].donor_id, "D2");
        assert_eq!(ranked[0].updated_score, Some(100.0));
        assert_eq!(ranked[1].donor_id, "D1");
        assert_eq!(ranked[1].mismatches_donor, 2);
    }
}
