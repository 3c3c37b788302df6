//! # MHC Matchmaker
//!
//! Donor/recipient compatibility analysis on MHC (HLA) allele sequences.
//!
//! ## Pipeline
//!
//! Each run resolves the input haplotypes against an allele reference store,
//! buckets alleles into structural classes, merges each individual's alleles
//! per class, computes positional residue differences for every
//! recipient/donor pair, drops mismatches at buried positions using averaged
//! solvent accessibility, and finally reports which mismatches form known
//! eplets.
//!
//! ## Features
//!
//! - Fuzzy allele resolution (secondary names, similar base alleles)
//! - Per-pair, per-class mismatch and residue statistics
//! - RSA/ASA averaging and accessibility filtering
//! - Known-eplet detection through a position index
//! - Donor ranking per recipient
//! - CSV, TSV, JSON and HTML reports, batch runs in parallel

pub mod analysis;
pub mod config;
pub mod context;
pub mod database;
pub mod discovery;
pub mod eplets;
pub mod error;
pub mod matchmaker;
pub mod output;
pub mod parsers;
pub mod ranking;
pub mod resolver;
pub mod types;

// Re-export key types
pub use analysis::{AlleleGrouper, DifferenceScorer, HaplotypeClassifier, SasAverager, SasFilter};
pub use config::MatchConfig;
pub use context::{MatchContext, Stage};
pub use database::{AlleleDatabase, JsonAlleleStore};
pub use discovery::DatasetDiscovery;
pub use eplets::{EpletDictionary, EpletIndex, EpletMatcher};
pub use error::{DatabaseError, MatchError, Result};
pub use matchmaker::{MatchResults, Matchmaker};
pub use output::{ReportFormat, ReportGenerator};
pub use parsers::{DatasetParser, ParsedDataset};
pub use ranking::{RankingEntry, RecipientRanking};
pub use resolver::AlleleResolver;
pub use types::*;
