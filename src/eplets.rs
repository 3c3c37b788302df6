//! Known-eplet dictionaries and mismatch-to-eplet matching.
//!
//! An eplet is a motif of residues at 1-indexed aligned positions. The
//! matcher walks the accessibility-filtered mismatches of every
//! donor/recipient pair, looks candidate eplets up in an inverted position
//! index and confirms the full motif on the presenting side.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

use crate::context::{MatchContext, Stage};
use crate::database::AlleleDatabase;
use crate::error::{DatabaseError, MatchError, Result};
use crate::types::*;

/// Residues shown either side of an eplet in the display window
const WINDOW_BUFFER: usize = 2;

/// Residue required at each 1-indexed position
pub type Motif = BTreeMap<usize, char>;

/// Eplet id -> motif, for one eplet family
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpletDictionary {
    motifs: BTreeMap<String, Motif>,
}

impl EpletDictionary {
    pub fn new(motifs: BTreeMap<String, Motif>) -> Self {
        Self { motifs }
    }

    /// Read the on-disk layout `{"eplet": {"position": "residue", ...}, ...}`
    pub fn from_reader<R: Read>(reader: R) -> std::result::Result<Self, DatabaseError> {
        let raw: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_reader(reader)?;
        let mut motifs = BTreeMap::new();

        for (eplet, positions) in raw {
            let mut motif = Motif::new();
            for (position, residue) in positions {
                let pos: usize = position
                    .trim()
                    .parse()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| DatabaseError::InvalidMotif {
                        eplet: eplet.clone(),
                        reason: format!("position {position:?} is not a positive integer"),
                    })?;
                let mut chars = residue.chars();
                let residue = match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => {
                        return Err(DatabaseError::InvalidMotif {
                            eplet: eplet.clone(),
                            reason: format!("residue {residue:?} is not a single character"),
                        })
                    }
                };
                motif.insert(pos, residue);
            }
            if motif.is_empty() {
                return Err(DatabaseError::InvalidMotif {
                    eplet,
                    reason: "motif has no positions".to_string(),
                });
            }
            motifs.insert(eplet, motif);
        }

        Ok(Self { motifs })
    }

    pub fn get(&self, eplet: &str) -> Option<&Motif> {
        self.motifs.get(eplet)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Motif)> {
        self.motifs.iter()
    }

    pub fn len(&self) -> usize {
        self.motifs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motifs.is_empty()
    }
}

/// Whether every position of `motif` carries the required residue in `aligned_seq`
pub fn motif_present(aligned_seq: &str, motif: &Motif) -> bool {
    let residues = aligned_seq.as_bytes();
    motif.iter().all(|(pos, residue)| {
        pos.checked_sub(1)
            .and_then(|i| residues.get(i))
            .map(|b| *b as char == *residue)
            .unwrap_or(false)
    })
}

/// Display window around a motif, clamped at position 1
pub fn motif_window(motif: &Motif) -> (usize, usize) {
    let min = motif.keys().next().copied().unwrap_or(1);
    let max = motif.keys().next_back().copied().unwrap_or(min);
    (min.saturating_sub(WINDOW_BUFFER).max(1), max + WINDOW_BUFFER)
}

/// Inverted index: position -> eplets whose motif includes it
#[derive(Debug, Clone)]
pub struct EpletIndex {
    dictionary: Arc<EpletDictionary>,
    by_position: BTreeMap<usize, Vec<String>>,
}

impl EpletIndex {
    pub fn new(dictionary: Arc<EpletDictionary>) -> Self {
        let mut by_position: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for (eplet, motif) in dictionary.iter() {
            for pos in motif.keys() {
                by_position.entry(*pos).or_default().push(eplet.clone());
            }
        }
        Self {
            dictionary,
            by_position,
        }
    }

    pub fn dictionary(&self) -> &EpletDictionary {
        &self.dictionary
    }

    /// Eplets with a motif position at `position`
    pub fn candidates(&self, position: usize) -> &[String] {
        self.by_position
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every eplet of the dictionary fully present in an aligned sequence
    pub fn scan(&self, aligned_seq: &str) -> Vec<String> {
        let mut found = BTreeSet::new();
        for position in 1..=aligned_seq.len() {
            for eplet in self.candidates(position) {
                if found.contains(eplet) {
                    continue;
                }
                if let Some(motif) = self.dictionary.get(eplet) {
                    if motif_present(aligned_seq, motif) {
                        found.insert(eplet.clone());
                    }
                }
            }
        }
        found.into_iter().collect()
    }
}

/// Whether an allele presents an eplet, trusting its precomputed tags when present
pub fn carries_eplet(allele: &Allele, eplet: &str, motif: &Motif) -> bool {
    match &allele.eplets {
        Some(tags) => tags.iter().any(|tag| tag == eplet),
        None => motif_present(&allele.aligned_seq, motif),
    }
}

/// Which side of a pair presents the mismatching residues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    DonorDiff,
    RecipDiff,
}

/// Detects known eplets in the filtered mismatches of every pair
pub struct EpletMatcher<'a> {
    db: &'a dyn AlleleDatabase,
}

impl<'a> EpletMatcher<'a> {
    pub fn new(db: &'a dyn AlleleDatabase) -> Self {
        Self { db }
    }

    pub fn run(&self, ctx: &mut MatchContext) -> Result<()> {
        ctx.begin(Stage::EpletsMatched)?;

        let mut indexes: BTreeMap<EpletFamily, EpletIndex> = BTreeMap::new();
        for family in EpletFamily::ALL {
            if let Some(dictionary) = self.db.eplet_dictionary(family)? {
                indexes.insert(family, EpletIndex::new(dictionary));
            }
        }

        let mut eplets_found = EpletsFound::new();
        for recipient in ctx.recipients() {
            let per_donor = eplets_found.entry(recipient.id.clone()).or_default();
            for donor in ctx.donors() {
                let mut class_eplets = BTreeMap::new();
                for class in AlleleClass::ALL {
                    let Some(index) = class.eplet_family().and_then(|f| indexes.get(&f)) else {
                        continue;
                    };
                    let difference = ctx
                        .difference_scoring
                        .get(&recipient.id)
                        .and_then(|donors| donors.get(&donor.id))
                        .and_then(|classes| classes.get(&class))
                        .ok_or_else(|| MatchError::ClassKeyMismatch {
                            donor: donor.id.clone(),
                            recipient: recipient.id.clone(),
                        })?;
                    let (Some(donor_mismatches), Some(recip_mismatches)) = (
                        difference.updated_mismatches(),
                        difference.updated_recip_mismatches(),
                    ) else {
                        return Err(MatchError::StageOrder {
                            requested: Stage::EpletsMatched.name(),
                            required: Stage::Filtered.name(),
                        });
                    };

                    let found = ClassEplets {
                        donor_diff: self.match_direction(
                            ctx,
                            index,
                            Direction::DonorDiff,
                            donor.alleles_in(class),
                            recipient.alleles_in(class),
                            donor_mismatches,
                        )?,
                        recip_diff: self.match_direction(
                            ctx,
                            index,
                            Direction::RecipDiff,
                            donor.alleles_in(class),
                            recipient.alleles_in(class),
                            recip_mismatches,
                        )?,
                    };

                    if !found.is_empty() {
                        info!(
                            "Known eplets for recipient {} and donor {} in class {}",
                            recipient.id, donor.id, class
                        );
                        class_eplets.insert(class, found);
                    }
                }
                per_donor.insert(donor.id.clone(), class_eplets);
            }
        }

        ctx.eplets_found = eplets_found;
        ctx.complete(Stage::EpletsMatched);
        info!("Known eplets checked for all recipient and donor pairs");
        Ok(())
    }

    /// Match one mismatch direction of one pair and class.
    ///
    /// The presenting side must carry the full motif on at least one allele
    /// and the opposing side must have at least one allele whose residue at
    /// the triggering position is not among the mismatching residues.
    fn match_direction(
        &self,
        ctx: &MatchContext,
        index: &EpletIndex,
        direction: Direction,
        donor_alleles: &[String],
        recipient_alleles: &[String],
        mismatches: &[Mismatch],
    ) -> Result<BTreeMap<String, EpletMatch>> {
        let (presenting, opposing) = match direction {
            Direction::DonorDiff => (donor_alleles, recipient_alleles),
            Direction::RecipDiff => (recipient_alleles, donor_alleles),
        };

        let mut found = BTreeMap::new();
        let mut tried: HashSet<&str> = HashSet::new();

        for (offset, mismatch) in mismatches.iter().enumerate() {
            if mismatch.is_empty() || mismatch.iter().all(|r| *r == GAP) {
                continue;
            }
            let position = offset + 1;

            for eplet in index.candidates(position) {
                if !tried.insert(eplet.as_str()) {
                    continue;
                }
                let Some(motif) = index.dictionary().get(eplet) else {
                    continue;
                };

                let mut carriers = Vec::new();
                for id in presenting {
                    if carries_eplet(ctx.allele(id)?, eplet, motif) {
                        carriers.push(id.clone());
                    }
                }
                let mut lacking = Vec::new();
                for id in opposing {
                    let residue = ctx.allele(id)?.residue_at(position).unwrap_or(GAP);
                    if !mismatch.contains(&residue) {
                        lacking.push(id.clone());
                    }
                }

                if carriers.is_empty() || lacking.is_empty() {
                    continue;
                }
                debug!("Eplet {} confirmed at position {}", eplet, position);

                let (min_pos, max_pos) = motif_window(motif);
                let (donors, recipients) = match direction {
                    Direction::DonorDiff => (carriers, lacking),
                    Direction::RecipDiff => (lacking, carriers),
                };
                found.insert(
                    eplet.clone(),
                    EpletMatch {
                        donors,
                        recipients,
                        mismatch_position: position,
                        min_pos,
                        max_pos,
                        eplet_data: motif.clone(),
                    },
                );
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary() -> Arc<EpletDictionary> {
        let json = r#"{
            "2A9Y": {"2": "A", "9": "Y"},
            "2S": {"2": "S"},
            "9F": {"9": "F"}
        }"#;
        Arc::new(EpletDictionary::from_reader(json.as_bytes()).unwrap())
    }

    #[test]
    fn test_index_lists_every_motif_position() {
        let index = EpletIndex::new(dictionary());
        assert_eq!(index.candidates(2), ["2A9Y".to_string(), "2S".to_string()]);
        assert_eq!(index.candidates(9), ["2A9Y".to_string(), "9F".to_string()]);
        assert!(index.candidates(5).is_empty());
    }

    #[test]
    fn test_scan_requires_full_motif() {
        let index = EpletIndex::new(dictionary());
        assert_eq!(index.scan("GAHSMRYFYT"), vec!["2A9Y".to_string()]);
        assert_eq!(index.scan("GSHSMRYFFT"), vec!["2S".to_string(), "9F".to_string()]);
        // position 9 falls past the end
        assert_eq!(index.scan("GAHS"), Vec::<String>::new());
    }

    #[test]
    fn test_window_is_padded_and_clamped() {
        let dict = dictionary();
        assert_eq!(motif_window(dict.get("2A9Y").unwrap()), (1, 11));
        assert_eq!(motif_window(dict.get("9F").unwrap()), (7, 11));
    }

    #[test]
    fn test_precomputed_tags_take_precedence() {
        let dict = dictionary();
        let motif = dict.get("2S").unwrap();
        let mut allele = Allele {
            aligned_seq: "GSHSMRYFFT".to_string(),
            ..Default::default()
        };
        assert!(carries_eplet(&allele, "2S", motif));

        allele.eplets = Some(vec![]);
        assert!(!carries_eplet(&allele, "2S", motif));

        allele.aligned_seq = "GAHSMRYFYT".to_string();
        allele.eplets = Some(vec!["2S".to_string()]);
        assert!(carries_eplet(&allele, "2S", motif));
    }

    fn class_i_pair() -> (crate::database::JsonAlleleStore, MatchContext) {
        let store = crate::database::fixture_store();
        let mut ctx = MatchContext::new(vec![
            Individual::new("R1", Role::Recipient, vec!["A*02:01".to_string()]),
            Individual::new("D1", Role::Donor, vec!["A*01:01".to_string()]),
        ]);
        crate::resolver::AlleleResolver::new(&store)
            .run(&mut ctx)
            .unwrap();
        (store, ctx)
    }

    #[test]
    fn test_gap_only_mismatch_is_skipped() {
        let (store, ctx) = class_i_pair();
        let index = EpletIndex::new(store.eplet_dictionary(EpletFamily::ClassI).unwrap().unwrap());
        let matcher = EpletMatcher::new(&store);
        let donors = vec!["A*01:01".to_string()];
        let recipients = vec!["A*02:01".to_string()];

        // A*01:01 carries 2S; A*02:01 has A at position 2
        let mut mismatches: Vec<Mismatch> = vec![Vec::new(); 10];
        mismatches[1] = vec![GAP];
        let found = matcher
            .match_direction(&ctx, &index, Direction::DonorDiff, &donors, &recipients, &mismatches)
            .unwrap();
        assert!(found.is_empty());

        mismatches[1] = vec![GAP, 'S'];
        let found = matcher
            .match_direction(&ctx, &index, Direction::DonorDiff, &donors, &recipients, &mismatches)
            .unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["2S"]);
        assert_eq!(found["2S"].mismatch_position, 2);
    }

    #[test]
    fn test_missing_class_gives_gap_only_mismatches() {
        let store = crate::database::fixture_store();
        let dataset = crate::parsers::ParsedDataset::new(
            "ploidy",
            vec![
                Individual::new(
                    "R1",
                    Role::Recipient,
                    vec!["A*02:01".to_string(), "DRB1*15:01".to_string()],
                ),
                Individual::new("D1", Role::Donor, vec!["DRB1*03:01".to_string()]),
            ],
        )
        .unwrap();
        let results = crate::matchmaker::Matchmaker::new(&store, 0.25)
            .run(dataset)
            .unwrap();

        let class_i = &results.difference_scoring["R1"]["D1"][&AlleleClass::ClassI];
        assert!(class_i.donor_diff.iter().all(|m| m == &vec![GAP]));
        assert_eq!(class_i.recip_diff[1], vec!['A']);

        let found = &results.eplets_found["R1"]["D1"];
        assert!(!found.contains_key(&AlleleClass::ClassI));
        assert!(found[&AlleleClass::Drb].donor_diff.contains_key("7Y"));
    }

    #[test]
    fn test_dra_has_no_eplet_matching() {
        let store = crate::database::fixture_store();
        let dataset = crate::parsers::ParsedDataset::new(
            "dra",
            vec![
                Individual::new(
                    "R1",
                    Role::Recipient,
                    vec!["A*02:01".to_string(), "DRA*01:01".to_string()],
                ),
                Individual::new(
                    "D1",
                    Role::Donor,
                    vec!["A*01:01".to_string(), "DRA*01:02".to_string()],
                ),
            ],
        )
        .unwrap();
        let results = crate::matchmaker::Matchmaker::new(&store, 0.25)
            .run(dataset)
            .unwrap();

        let dra = &results.difference_scoring["R1"]["D1"][&AlleleClass::Dra];
        assert_eq!(dra.donor_diff[7], vec!['L']);
        assert_eq!(
            results.eplets_found["R1"]["D1"].keys().collect::<Vec<_>>(),
            vec![&AlleleClass::ClassI]
        );
    }

    #[test]
    fn test_malformed_motifs_are_rejected() {
        let bad_position = r#"{"X": {"0": "A"}}"#;
        assert!(EpletDictionary::from_reader(bad_position.as_bytes()).is_err());
        let bad_residue = r#"{"X": {"3": "AB"}}"#;
        assert!(EpletDictionary::from_reader(bad_residue.as_bytes()).is_err());
    }
}
