use flate2::read::MultiGzDecoder;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{MatchError, Result};
use crate::types::{Individual, Role};

pub mod csv_input;
pub mod json_input;

pub use csv_input::CsvDatasetParser;
pub use json_input::JsonDatasetParser;

/// Open a file for buffered reading, decompressing `.gz` transparently
pub fn open_file(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let file = File::open(path)?;
    let is_gzip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);

    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Guess the field delimiter from a header line
pub fn detect_delimiter(line: &str) -> u8 {
    let tabs = line.matches('\t').count();
    let commas = line.matches(',').count();
    let semicolons = line.matches(';').count();

    if tabs >= commas && tabs >= semicolons && tabs > 0 {
        b'\t'
    } else if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// Dataset layouts understood by [`DatasetParser`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv,
    Tsv,
    Json,
    Unknown,
}

impl DatasetFormat {
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let name = name.strip_suffix(".gz").unwrap_or(&name);

        match name.rsplit('.').next() {
            Some("csv") => DatasetFormat::Csv,
            Some("tsv") | Some("txt") => DatasetFormat::Tsv,
            Some("json") => DatasetFormat::Json,
            _ => DatasetFormat::Unknown,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, DatasetFormat::Unknown)
    }
}

/// Validated donors and recipients of one matching run
#[derive(Debug, Clone)]
pub struct ParsedDataset {
    pub name: String,
    pub individuals: Vec<Individual>,
}

impl ParsedDataset {
    /// Validate the input shape: unique non-empty identifiers, at least one
    /// donor and one recipient, and not every haplotype empty.
    pub fn new(name: impl Into<String>, individuals: Vec<Individual>) -> Result<Self> {
        if individuals.is_empty() {
            return Err(MatchError::Input("Input is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for individual in &individuals {
            if individual.id.trim().is_empty() {
                return Err(MatchError::Input(format!(
                    "{} with an empty identifier",
                    individual.role
                )));
            }
            if !seen.insert(individual.id.as_str()) {
                return Err(MatchError::Input(format!(
                    "Identifier {} is duplicated",
                    individual.id
                )));
            }
        }

        if !individuals.iter().any(|i| i.role == Role::Donor) {
            return Err(MatchError::Input(
                "Input must contain at least one donor".to_string(),
            ));
        }
        if !individuals.iter().any(|i| i.role == Role::Recipient) {
            return Err(MatchError::Input(
                "Input must contain at least one recipient".to_string(),
            ));
        }
        if individuals.iter().all(|i| i.haplotype.is_empty()) {
            return Err(MatchError::Input(
                "All donor and recipient haplotypes are empty".to_string(),
            ));
        }

        Ok(Self {
            name: name.into(),
            individuals,
        })
    }

    pub fn donor_count(&self) -> usize {
        self.individuals
            .iter()
            .filter(|i| i.role == Role::Donor)
            .count()
    }

    pub fn recipient_count(&self) -> usize {
        self.individuals
            .iter()
            .filter(|i| i.role == Role::Recipient)
            .count()
    }
}

/// Parse the role column of a row
pub(crate) fn parse_role(value: &str, row: usize) -> Result<Role> {
    Role::from_string(value).ok_or_else(|| {
        MatchError::Input(format!(
            "Row {row}: type must be Donor or Recipient, found {value:?}"
        ))
    })
}

/// Dispatches dataset files to the parser for their format
pub struct DatasetParser {
    csv: CsvDatasetParser,
    json: JsonDatasetParser,
}

impl DatasetParser {
    pub fn new() -> Self {
        Self {
            csv: CsvDatasetParser::new(),
            json: JsonDatasetParser::new(),
        }
    }

    pub fn parse(&self, path: &Path) -> Result<ParsedDataset> {
        let name = dataset_name(path);
        let mut content = String::new();
        open_file(path)?.read_to_string(&mut content)?;

        match DatasetFormat::from_path(path) {
            DatasetFormat::Csv | DatasetFormat::Tsv => self.csv.parse_str(&name, &content),
            DatasetFormat::Json => self.json.parse_str(&name, &content),
            DatasetFormat::Unknown => Err(MatchError::Input(format!(
                "Invalid input file format for {}. Please provide a CSV, TSV or JSON file.",
                path.display()
            ))),
        }
    }
}

impl Default for DatasetParser {
    fn default() -> Self {
        Self::new()
    }
}

/// File name without any extensions
pub fn dataset_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .filter(|n| !n.is_empty())
        .unwrap_or("dataset")
        .to_string()
}
