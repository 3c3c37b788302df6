use csv::{ReaderBuilder, StringRecord};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{MatchError, Result};
use crate::parsers::{detect_delimiter, parse_role, ParsedDataset};
use crate::types::*;

lazy_static! {
    static ref QUOTED_ALLELE: Regex = Regex::new(r#"'([^']*)'|"([^"]*)""#).unwrap();
}

/// Header of the long layout, one row per individual
const LONG_HEADER: [&str; 3] = ["identifier", "type", "haplotype"];

/// Parser for delimited donor/recipient tables.
///
/// Two layouts are accepted:
/// - long: `identifier,type,haplotype` where the haplotype cell is a list
///   literal such as `['A*01:01', 'B*08:01']`
/// - wide: `identifier,type,...` with one allele per remaining cell, as
///   exported from a spreadsheet; blank cells are ignored
pub struct CsvDatasetParser;

impl CsvDatasetParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, name: &str, content: &str) -> Result<ParsedDataset> {
        let first_line = content.lines().next().unwrap_or_default();
        if first_line.trim().is_empty() {
            return Err(MatchError::Input("Input is empty".to_string()));
        }

        let mut reader = ReaderBuilder::new()
            .delimiter(detect_delimiter(first_line))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(|h| h.to_lowercase())
            .collect();

        let long = headers == LONG_HEADER;
        if !long && (headers.len() < 2 || headers[0] != "identifier" || headers[1] != "type") {
            return Err(MatchError::Input(
                "Input must contain identifier, type and haplotype columns".to_string(),
            ));
        }

        let mut individuals = Vec::new();
        for (i, record) in reader.records().enumerate() {
            let record = record.map_err(csv_error)?;
            // header is row 1
            let row = i + 2;
            if record.iter().all(str::is_empty) {
                continue;
            }

            let individual = if long {
                self.parse_long_row(&record, row)?
            } else {
                match self.parse_wide_row(&record, row)? {
                    Some(individual) => individual,
                    None => continue,
                }
            };
            individuals.push(individual);
        }

        ParsedDataset::new(name, individuals)
    }

    fn parse_long_row(&self, record: &StringRecord, row: usize) -> Result<Individual> {
        if record.len() != LONG_HEADER.len() {
            return Err(MatchError::Input(format!(
                "Row {row}: expected 3 columns, found {}",
                record.len()
            )));
        }
        let role = parse_role(&record[1], row)?;
        let haplotype = parse_haplotype_literal(&record[2])
            .map_err(|msg| MatchError::Input(format!("Row {row}: {msg}")))?;
        Ok(Individual::new(&record[0], role, haplotype))
    }

    /// Rows with an empty type cell carry no individual and are skipped
    fn parse_wide_row(&self, record: &StringRecord, row: usize) -> Result<Option<Individual>> {
        let role_cell = record.get(1).unwrap_or_default();
        if role_cell.is_empty() {
            return Ok(None);
        }
        let role = parse_role(role_cell, row)?;
        let haplotype = record
            .iter()
            .skip(2)
            .filter(|cell| !cell.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Some(Individual::new(&record[0], role, haplotype)))
    }
}

impl Default for CsvDatasetParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a list literal such as `['A*01:01', "B*08:01"]`
pub fn parse_haplotype_literal(cell: &str) -> std::result::Result<Vec<String>, String> {
    let inner = cell
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| format!("haplotype {cell:?} is not a list"))?;

    let alleles: Vec<String> = QUOTED_ALLELE
        .captures_iter(inner)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .collect();

    if alleles.is_empty() && !inner.trim().is_empty() {
        return Err(format!("haplotype {cell:?} contains no quoted alleles"));
    }
    Ok(alleles)
}

fn csv_error(err: csv::Error) -> MatchError {
    MatchError::Input(format!("Malformed table: {err}"))
}
