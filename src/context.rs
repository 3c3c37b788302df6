//! Pipeline context threaded through every matching stage.
//!
//! One context belongs to one run. Stages borrow it mutably, check that their
//! predecessor has completed and discard anything a previous run of the same
//! stage (or a later one) produced before writing their own output.

use std::collections::BTreeMap;

use crate::error::{MatchError, Result};
use crate::types::*;

/// Pipeline progress, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Loaded,
    Resolved,
    Classified,
    Grouped,
    Scored,
    Averaged,
    Filtered,
    EpletsMatched,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Loaded => "load",
            Stage::Resolved => "resolve",
            Stage::Classified => "classify",
            Stage::Grouped => "group",
            Stage::Scored => "difference scoring",
            Stage::Averaged => "accessibility averaging",
            Stage::Filtered => "accessibility filtering",
            Stage::EpletsMatched => "eplet matching",
        }
    }

    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Loaded => None,
            Stage::Resolved => Some(Stage::Loaded),
            Stage::Classified => Some(Stage::Resolved),
            Stage::Grouped => Some(Stage::Classified),
            Stage::Scored => Some(Stage::Grouped),
            Stage::Averaged => Some(Stage::Scored),
            Stage::Filtered => Some(Stage::Averaged),
            Stage::EpletsMatched => Some(Stage::Filtered),
        }
    }
}

/// Per-run state: individuals, the local allele cache and every stage output
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub(crate) stage: Stage,
    pub(crate) individuals: BTreeMap<String, Individual>,
    pub(crate) audit: AlleleAudit,
    pub(crate) cache: BTreeMap<String, Allele>,
    pub(crate) difference_scoring: DifferenceScoring,
    pub(crate) sas_scores: SasScores,
    pub(crate) rsa_threshold: Option<f64>,
    pub(crate) eplets_found: EpletsFound,
}

impl MatchContext {
    /// Start a run from raw individuals. Later duplicates of an id replace earlier ones;
    /// input validation rejects duplicates before this point.
    pub fn new(individuals: impl IntoIterator<Item = Individual>) -> Self {
        Self {
            stage: Stage::Loaded,
            individuals: individuals
                .into_iter()
                .map(|individual| (individual.id.clone(), individual))
                .collect(),
            audit: AlleleAudit::default(),
            cache: BTreeMap::new(),
            difference_scoring: BTreeMap::new(),
            sas_scores: BTreeMap::new(),
            rsa_threshold: None,
            eplets_found: BTreeMap::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn individuals(&self) -> &BTreeMap<String, Individual> {
        &self.individuals
    }

    pub fn individual(&self, id: &str) -> Option<&Individual> {
        self.individuals.get(id)
    }

    pub fn donors(&self) -> impl Iterator<Item = &Individual> {
        self.individuals.values().filter(|i| i.role == Role::Donor)
    }

    pub fn recipients(&self) -> impl Iterator<Item = &Individual> {
        self.individuals
            .values()
            .filter(|i| i.role == Role::Recipient)
    }

    pub fn audit(&self) -> &AlleleAudit {
        &self.audit
    }

    /// Cached reference record of a resolved allele
    pub fn allele(&self, id: &str) -> Result<&Allele> {
        self.cache
            .get(id)
            .ok_or_else(|| MatchError::MissingAllele(id.to_string()))
    }

    pub fn cached_alleles(&self) -> &BTreeMap<String, Allele> {
        &self.cache
    }

    pub fn difference_scoring(&self) -> &DifferenceScoring {
        &self.difference_scoring
    }

    pub fn sas_scores(&self) -> &SasScores {
        &self.sas_scores
    }

    pub fn rsa_threshold(&self) -> Option<f64> {
        self.rsa_threshold
    }

    pub fn eplets_found(&self) -> &EpletsFound {
        &self.eplets_found
    }

    /// Classes in which at least one individual carries an allele
    pub fn relevant_classes(&self) -> Vec<AlleleClass> {
        AlleleClass::ALL
            .into_iter()
            .filter(|class| {
                self.individuals
                    .values()
                    .any(|individual| !individual.alleles_in(*class).is_empty())
            })
            .collect()
    }

    /// Check ordering and discard stale output before `stage` runs
    pub(crate) fn begin(&mut self, stage: Stage) -> Result<()> {
        let Some(required) = stage.previous() else {
            return Ok(());
        };
        if self.stage < required {
            return Err(MatchError::StageOrder {
                requested: stage.name(),
                required: required.name(),
            });
        }
        self.rewind(required);
        Ok(())
    }

    pub(crate) fn complete(&mut self, stage: Stage) {
        self.stage = stage;
    }

    fn rewind(&mut self, to: Stage) {
        if to < Stage::Resolved {
            self.audit = AlleleAudit::default();
            self.cache.clear();
            for individual in self.individuals.values_mut() {
                individual.haplotype = individual.input_haplotype.clone();
            }
        }
        if to < Stage::Classified {
            for individual in self.individuals.values_mut() {
                individual.classified.clear();
            }
        }
        if to < Stage::Grouped {
            for individual in self.individuals.values_mut() {
                individual.grouped.clear();
            }
        }
        if to < Stage::Scored {
            self.difference_scoring.clear();
        }
        if to < Stage::Averaged {
            self.sas_scores.clear();
        }
        if to < Stage::Filtered {
            self.rsa_threshold = None;
            for classes in self
                .difference_scoring
                .values_mut()
                .flat_map(|donors| donors.values_mut())
            {
                for difference in classes.values_mut() {
                    difference.filtered = None;
                }
            }
        }
        if to < Stage::EpletsMatched {
            self.eplets_found.clear();
        }
        self.stage = to;
    }
}
