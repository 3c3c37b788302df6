use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{MatchError, Result};

/// Marker used to pad aligned and grouped sequences
pub const GAP: char = '-';

/// Structural class an allele is bucketed into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlleleClass {
    #[serde(rename = "I")]
    ClassI,
    #[serde(rename = "IIDQA")]
    Dqa,
    #[serde(rename = "IIDQB")]
    Dqb,
    #[serde(rename = "IIDRA")]
    Dra,
    #[serde(rename = "IIDRB")]
    Drb,
}

impl AlleleClass {
    pub const ALL: [AlleleClass; 5] = [
        AlleleClass::ClassI,
        AlleleClass::Dqa,
        AlleleClass::Dqb,
        AlleleClass::Dra,
        AlleleClass::Drb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlleleClass::ClassI => "I",
            AlleleClass::Dqa => "IIDQA",
            AlleleClass::Dqb => "IIDQB",
            AlleleClass::Dra => "IIDRA",
            AlleleClass::Drb => "IIDRB",
        }
    }

    /// Bucket an allele by its class tag and locus.
    ///
    /// Class "I" alleles all share one bucket; class "II" alleles are split
    /// on the locus substring. Anything else cannot be classified.
    pub fn of(allele: &Allele) -> Result<Self> {
        let locus = allele.locus.as_deref().unwrap_or_default();
        match allele.allele_class.as_deref() {
            Some("I") => Ok(AlleleClass::ClassI),
            Some("II") if locus.contains("DQA") => Ok(AlleleClass::Dqa),
            Some("II") if locus.contains("DQB") => Ok(AlleleClass::Dqb),
            Some("II") if locus.contains("DRA") => Ok(AlleleClass::Dra),
            Some("II") if locus.contains("DRB") => Ok(AlleleClass::Drb),
            _ => Err(MatchError::Unclassifiable {
                allele: allele.id.clone(),
                allele_class: allele.allele_class.clone(),
                locus: allele.locus.clone(),
            }),
        }
    }

    /// Known-eplet dictionary this class is matched against (DQA and DQB share one)
    pub fn eplet_family(&self) -> Option<EpletFamily> {
        match self {
            AlleleClass::ClassI => Some(EpletFamily::ClassI),
            AlleleClass::Dqa | AlleleClass::Dqb => Some(EpletFamily::Dq),
            AlleleClass::Dra => None,
            AlleleClass::Drb => Some(EpletFamily::Drb),
        }
    }
}

impl fmt::Display for AlleleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known-eplet dictionaries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EpletFamily {
    ClassI,
    Dq,
    Drb,
}

impl EpletFamily {
    pub const ALL: [EpletFamily; 3] = [EpletFamily::ClassI, EpletFamily::Dq, EpletFamily::Drb];

    /// File name the dictionary is stored under in an eplet directory
    pub fn file_name(&self) -> &'static str {
        match self {
            EpletFamily::ClassI => "eplets_I.json",
            EpletFamily::Dq => "eplets_DQ.json",
            EpletFamily::Drb => "eplets_DRB.json",
        }
    }
}

/// Role of an individual in a matching run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Donor,
    Recipient,
}

impl Role {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim() {
            "Donor" => Some(Role::Donor),
            "Recipient" => Some(Role::Recipient),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Donor => f.write_str("Donor"),
            Role::Recipient => f.write_str("Recipient"),
        }
    }
}

/// Reference record for one allele.
///
/// Accessibility arrays are aligned to the class consensus; a missing array
/// (`None`) and a missing value at one position (`Some(None)`) mean different
/// things to the averaging stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Allele {
    #[serde(rename = "_id", alias = "id", default)]
    pub id: String,
    #[serde(default)]
    pub accession: String,
    #[serde(default)]
    pub sequence: String,
    #[serde(default)]
    pub aligned_seq: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub secondary_names: Vec<String>,
    #[serde(default)]
    pub allele_class: Option<String>,
    #[serde(default)]
    pub locus: Option<String>,
    #[serde(default)]
    pub aligned_rsa: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub aligned_asa: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub eplets: Option<Vec<String>>,
}

impl Allele {
    pub fn is_abandoned(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("abandoned"))
            .unwrap_or(false)
    }

    /// Whether the record can stand in for an unresolved identifier
    pub fn is_usable(&self) -> bool {
        !self.is_abandoned() && !self.aligned_seq.is_empty()
    }

    /// Residue at a 1-indexed aligned position
    pub fn residue_at(&self, position: usize) -> Option<char> {
        if position == 0 {
            return None;
        }
        self.aligned_seq
            .as_bytes()
            .get(position - 1)
            .map(|b| *b as char)
    }

    pub fn aligned_len(&self) -> usize {
        self.aligned_seq.len()
    }
}

/// Class buckets of one individual's haplotype
pub type ClassifiedHaplotype = BTreeMap<AlleleClass, Vec<String>>;

/// Per-position residue strings, one character per allele in the class
pub type GroupedSequence = Vec<String>;

pub type GroupedHaplotype = BTreeMap<AlleleClass, GroupedSequence>;

/// A donor or recipient and the state the pipeline builds up for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Individual {
    pub id: String,
    pub role: Role,
    /// Resolved identifiers once the resolver has run, the input identifiers before
    pub haplotype: Vec<String>,
    /// Identifiers as given in the input; resolution always starts from these
    #[serde(default)]
    pub input_haplotype: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub classified: ClassifiedHaplotype,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub grouped: GroupedHaplotype,
}

impl Individual {
    pub fn new(id: impl Into<String>, role: Role, haplotype: Vec<String>) -> Self {
        Self {
            id: id.into(),
            role,
            input_haplotype: haplotype.clone(),
            haplotype,
            classified: BTreeMap::new(),
            grouped: BTreeMap::new(),
        }
    }

    pub fn alleles_in(&self, class: AlleleClass) -> &[String] {
        self.classified
            .get(&class)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Residues present on one side of a position but absent from the other
pub type Mismatch = Vec<char>;

/// Mismatch lists after accessibility filtering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilteredMismatches {
    pub updated_mismatches: Vec<Mismatch>,
    pub updated_mismatches_count: usize,
    pub updated_recip_mismatches: Vec<Mismatch>,
    pub updated_recip_mismatches_count: usize,
}

/// Positional differences between one donor and one recipient in one class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassDifference {
    pub donor_diff: Vec<Mismatch>,
    pub recip_diff: Vec<Mismatch>,
    pub donor_diff_score: usize,
    pub recip_diff_score: usize,
    pub all_donor_diff_counts: Vec<BTreeMap<char, usize>>,
    pub all_donor_diff_ratios: Vec<BTreeMap<char, f64>>,
    pub all_recip_diff_counts: Vec<BTreeMap<char, usize>>,
    pub all_recip_diff_ratios: Vec<BTreeMap<char, f64>>,
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub filtered: Option<FilteredMismatches>,
}

impl ClassDifference {
    pub fn len(&self) -> usize {
        self.donor_diff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.donor_diff.is_empty()
    }

    pub fn updated_mismatches(&self) -> Option<&[Mismatch]> {
        self.filtered
            .as_ref()
            .map(|f| f.updated_mismatches.as_slice())
    }

    pub fn updated_recip_mismatches(&self) -> Option<&[Mismatch]> {
        self.filtered
            .as_ref()
            .map(|f| f.updated_recip_mismatches.as_slice())
    }
}

/// recipient -> donor -> class -> differences
pub type DifferenceScoring =
    BTreeMap<String, BTreeMap<String, BTreeMap<AlleleClass, ClassDifference>>>;

/// Averaged solvent accessibility at one aligned position
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SasScore {
    pub rsa: Option<f64>,
    pub asa: Option<f64>,
    /// Alleles that contributed a value
    pub total: usize,
}

/// individual -> class -> per-position averages (0-indexed)
pub type SasScores = BTreeMap<String, BTreeMap<AlleleClass, Vec<SasScore>>>;

/// A known eplet detected in a donor/recipient mismatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpletMatch {
    /// Donor alleles involved: carriers for donor-side eplets, non-carriers of the residue otherwise
    pub donors: Vec<String>,
    /// Recipient alleles involved, mirrored
    pub recipients: Vec<String>,
    /// 1-indexed position of the mismatch that triggered the check
    pub mismatch_position: usize,
    /// First position of the display window, two before the motif start but never below 1
    pub min_pos: usize,
    /// Last position of the display window, two past the motif end
    pub max_pos: usize,
    pub eplet_data: BTreeMap<usize, char>,
}

/// Eplets found for one pair and class, per mismatch direction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassEplets {
    pub donor_diff: BTreeMap<String, EpletMatch>,
    pub recip_diff: BTreeMap<String, EpletMatch>,
}

impl ClassEplets {
    pub fn is_empty(&self) -> bool {
        self.donor_diff.is_empty() && self.recip_diff.is_empty()
    }
}

/// recipient -> donor -> class -> eplets; classes without eplets are omitted
pub type EpletsFound = BTreeMap<String, BTreeMap<String, BTreeMap<AlleleClass, ClassEplets>>>;

/// Audit trail of the resolution stage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AlleleAudit {
    pub invalid_alleles: Vec<String>,
    pub transformed_alleles: BTreeMap<String, String>,
}
