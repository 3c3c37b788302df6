use std::path::PathBuf;
use thiserror::Error;

/// Failures of the allele reference store
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Allele reference store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed reference data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid eplet {eplet}: {reason}")]
    InvalidMotif { eplet: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by a matching run. Every variant aborts the run.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("{allele} could not be classified (class {allele_class:?}, locus {locus:?})")]
    Unclassifiable {
        allele: String,
        allele_class: Option<String>,
        locus: Option<String>,
    },

    #[error("{id} has {haplotype} alleles but {classified} were classified")]
    ClassificationMismatch {
        id: String,
        haplotype: usize,
        classified: usize,
    },

    #[error("Donor {donor} and recipient {recipient} have different classes")]
    ClassKeyMismatch { donor: String, recipient: String },

    #[error("Allele {allele} has no aligned {field}")]
    MissingAccessibility { allele: String, field: &'static str },

    #[error("Allele {0} missing from the local allele cache")]
    MissingAllele(String),

    #[error("Stage {requested} requires {required} to have run first")]
    StageOrder {
        requested: &'static str,
        required: &'static str,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MatchError>;
