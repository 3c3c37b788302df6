use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::context::{MatchContext, Stage};
use crate::database::AlleleDatabase;
use crate::error::Result;
use crate::types::*;

lazy_static! {
    static ref NAME_FIELDS: Regex = Regex::new(r"[*:]").unwrap();
}

/// Split an allele name into its fields, e.g. `A*01:01:01` -> `[A, 01, 01, 01]`
pub fn allele_fields(name: &str) -> Vec<&str> {
    NAME_FIELDS.split(name).collect()
}

/// Locus plus the first two fields, e.g. `A*01:01:01:02N` -> `A*01:01`
pub fn base_allele_name(name: &str) -> String {
    let fields = allele_fields(name);
    let mut fields = fields.into_iter().take(3);
    let locus = fields.next().unwrap_or_default();
    let rest: Vec<&str> = fields.collect();
    if rest.is_empty() {
        locus.to_string()
    } else {
        format!("{}*{}", locus, rest.join(":"))
    }
}

/// Outcome of resolving one raw identifier
#[derive(Debug, Clone)]
enum Resolution {
    Exact(Allele),
    Substituted(Allele),
    Invalid,
}

/// Maps raw haplotype identifiers onto alleles present in the reference store
pub struct AlleleResolver<'a> {
    db: &'a dyn AlleleDatabase,
}

impl<'a> AlleleResolver<'a> {
    pub fn new(db: &'a dyn AlleleDatabase) -> Self {
        Self { db }
    }

    /// Resolve every haplotype in place and fill the local allele cache.
    ///
    /// Substitutions keep their haplotype position. Unresolvable identifiers
    /// are dropped and listed in the audit; only store failures abort.
    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::Resolved)?;

        let mut audit = AlleleAudit::default();
        let mut cache: BTreeMap<String, Allele> = BTreeMap::new();
        let mut seen: BTreeMap<String, Resolution> = BTreeMap::new();

        for individual in ctx.individuals.values_mut() {
            let mut resolved = Vec::with_capacity(individual.input_haplotype.len());

            for raw in &individual.input_haplotype {
                let resolution = match seen.get(raw) {
                    Some(resolution) => resolution.clone(),
                    None => {
                        let resolution = self.resolve(raw)?;
                        seen.insert(raw.clone(), resolution.clone());
                        resolution
                    }
                };

                match resolution {
                    Resolution::Exact(allele) => {
                        resolved.push(allele.id.clone());
                        cache.entry(allele.id.clone()).or_insert(allele);
                    }
                    Resolution::Substituted(allele) => {
                        audit
                            .transformed_alleles
                            .insert(raw.clone(), allele.id.clone());
                        resolved.push(allele.id.clone());
                        cache.entry(allele.id.clone()).or_insert(allele);
                    }
                    Resolution::Invalid => {
                        warn!(
                            "Allele {} of {} not found in database and no similar allele found",
                            raw, individual.id
                        );
                        audit.invalid_alleles.push(raw.clone());
                    }
                }
            }

            individual.haplotype = resolved;
        }

        for allele in cache.values() {
            if allele.aligned_rsa.is_none() {
                warn!("Allele {} has no aligned rsa", allele.id);
            }
        }

        info!(
            "Resolved {} alleles, {} transformed, {} invalid",
            cache.len(),
            audit.transformed_alleles.len(),
            audit.invalid_alleles.len()
        );

        ctx.audit = audit;
        ctx.cache = cache;
        ctx.complete(Stage::Resolved);
        Ok(())
    }

    fn resolve(&self, raw: &str) -> Result<Resolution> {
        if let Some(allele) = self.db.find(raw)? {
            return Ok(Resolution::Exact(allele));
        }

        if let Some(allele) = self.db.find_by_secondary_name(raw)? {
            info!("Allele {} not found in database, but {} found", raw, allele.id);
            return Ok(Resolution::Substituted(allele));
        }

        let base = base_allele_name(raw);
        if base.is_empty() {
            return Ok(Resolution::Invalid);
        }

        let mut candidates: Vec<Allele> = self
            .db
            .search_substring(&base)?
            .into_iter()
            .filter(Allele::is_usable)
            .collect();
        debug!("{} candidates for base allele {}", candidates.len(), base);

        // stable sort keeps store order among equal lengths
        candidates.sort_by_key(|allele| allele.id.len());
        match candidates.len() {
            0 => Ok(Resolution::Invalid),
            1 => {
                let allele = candidates.remove(0);
                info!(
                    "Allele {} not found in database, but similar allele {} found",
                    raw, allele.id
                );
                Ok(Resolution::Substituted(allele))
            }
            n => {
                let allele = candidates.remove(0);
                info!(
                    "Allele {} not found in database, picked {} among {} similar alleles",
                    raw, allele.id, n
                );
                Ok(Resolution::Substituted(allele))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixture_store;

    fn context(haplotype: &[&str]) -> MatchContext {
        MatchContext::new(vec![
            Individual::new(
                "R1",
                Role::Recipient,
                haplotype.iter().map(|a| a.to_string()).collect(),
            ),
            Individual::new("D1", Role::Donor, vec!["A*01:01".to_string()]),
        ])
    }

    #[test]
    fn test_base_allele_name() {
        assert_eq!(base_allele_name("A*01:01:01:02N"), "A*01:01");
        assert_eq!(base_allele_name("DRB1*15:01"), "DRB1*15:01");
        assert_eq!(base_allele_name("A*02"), "A*02");
        assert_eq!(allele_fields("B*08:01:01"), vec!["B", "08", "01", "01"]);
    }

    #[test]
    fn test_resolution_rules() {
        let store = fixture_store();
        let mut ctx = context(&["A*0101", "Z*99:99", "B*08:01:01:01", "A*02:05:02", "A*02:01"]);
        AlleleResolver::new(&store).run(&mut ctx).unwrap();

        let recipient = ctx.individual("R1").unwrap();
        assert_eq!(
            recipient.haplotype,
            vec!["A*01:01", "B*08:01", "A*02:05:01", "A*02:01"]
        );
        assert_eq!(ctx.audit().invalid_alleles, vec!["Z*99:99"]);
        assert_eq!(ctx.audit().transformed_alleles["A*0101"], "A*01:01");
        assert_eq!(ctx.audit().transformed_alleles["B*08:01:01:01"], "B*08:01");
        // abandoned A*02:05 is skipped, shortest usable candidate wins
        assert_eq!(ctx.audit().transformed_alleles["A*02:05:02"], "A*02:05:01");
        assert!(!ctx.audit().transformed_alleles.contains_key("A*02:01"));
    }

    #[test]
    fn test_second_run_resolves_input_again() {
        let store = fixture_store();
        let mut ctx = context(&["A*0101", "Z*99:99", "A*02:01"]);
        let resolver = AlleleResolver::new(&store);
        resolver.run(&mut ctx).unwrap();
        let first = ctx.audit().clone();

        resolver.run(&mut ctx).unwrap();
        assert_eq!(ctx.audit(), &first);
        assert_eq!(ctx.audit().invalid_alleles, vec!["Z*99:99"]);
        assert_eq!(ctx.audit().transformed_alleles["A*0101"], "A*01:01");

        let recipient = ctx.individual("R1").unwrap();
        assert_eq!(recipient.haplotype, vec!["A*01:01", "A*02:01"]);
        assert_eq!(recipient.input_haplotype, vec!["A*0101", "Z*99:99", "A*02:01"]);
    }

    #[test]
    fn test_cache_covers_every_resolved_allele() {
        let store = fixture_store();
        let mut ctx = context(&["A*02:01", "DRB1*15:01"]);
        AlleleResolver::new(&store).run(&mut ctx).unwrap();

        for individual in ctx.individuals().values() {
            for id in &individual.haplotype {
                assert!(ctx.allele(id).is_ok(), "{id} missing from cache");
            }
        }
        assert_eq!(ctx.cached_alleles().len(), 3);
        assert_eq!(ctx.stage(), Stage::Resolved);
    }
}
