use serde::Deserialize;

use crate::error::{MatchError, Result};
use crate::parsers::{parse_role, ParsedDataset};
use crate::types::*;

#[derive(Debug, Deserialize)]
struct CreatedData {
    #[serde(default)]
    donors: Vec<CreatedEntry>,
    #[serde(default)]
    recipients: Vec<CreatedEntry>,
}

#[derive(Debug, Deserialize)]
struct CreatedEntry {
    identifier: String,
    #[serde(rename = "type", default)]
    role: Option<String>,
    #[serde(default)]
    alleles: Vec<String>,
}

/// Parser for `{"donors": [...], "recipients": [...]}` documents.
///
/// Each entry carries `identifier`, `alleles` and an optional `type`; when
/// the type is missing the list it appears in decides the role.
pub struct JsonDatasetParser;

impl JsonDatasetParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, name: &str, content: &str) -> Result<ParsedDataset> {
        let data: CreatedData = serde_json::from_str(content)
            .map_err(|e| MatchError::Input(format!("Malformed JSON input: {e}")))?;

        let entries = data
            .donors
            .into_iter()
            .map(|entry| (Role::Donor, entry))
            .chain(
                data.recipients
                    .into_iter()
                    .map(|entry| (Role::Recipient, entry)),
            );

        let mut individuals = Vec::new();
        for (row, (default_role, entry)) in entries.enumerate() {
            let role = match entry.role.as_deref() {
                Some(value) => parse_role(value, row + 1)?,
                None => default_role,
            };
            let haplotype = entry
                .alleles
                .iter()
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
            individuals.push(Individual::new(entry.identifier.trim(), role, haplotype));
        }

        ParsedDataset::new(name, individuals)
    }
}

impl Default for JsonDatasetParser {
    fn default() -> Self {
        Self::new()
    }
}
