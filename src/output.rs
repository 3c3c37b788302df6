use anyhow::{Context, Result};
use chrono::Local;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::matchmaker::MatchResults;
use crate::types::*;

/// Supported report formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Html,
    Csv,
    #[default]
    Json,
    Tsv,
    All,
}

/// Run overview written next to the detailed reports
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary<'a> {
    pub dataset: &'a str,
    pub generated_at: String,
    pub rsa_threshold: f64,
    pub donors: Vec<&'a str>,
    pub recipients: Vec<&'a str>,
    pub relevant_classes: &'a [AlleleClass],
    pub invalid_alleles: &'a [String],
    pub transformed_alleles: &'a BTreeMap<String, String>,
    pub eplet_hits: usize,
}

impl<'a> ReportSummary<'a> {
    pub fn new(results: &'a MatchResults) -> Self {
        Self {
            dataset: &results.dataset,
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            rsa_threshold: results.rsa_threshold,
            donors: results.donors().map(|d| d.id.as_str()).collect(),
            recipients: results.recipients().map(|r| r.id.as_str()).collect(),
            relevant_classes: &results.relevant_classes,
            invalid_alleles: &results.audit.invalid_alleles,
            transformed_alleles: &results.audit.transformed_alleles,
            eplet_hits: results.eplet_hits(),
        }
    }
}

/// Writes the reports of one matching run into a directory
pub struct ReportGenerator {
    output_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory {}", output_dir.display())
        })?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Generate reports in the requested format(s), returning the files written
    pub fn generate(&self, results: &MatchResults, format: ReportFormat) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        match format {
            ReportFormat::Html => written.push(self.generate_html_report(results)?),
            ReportFormat::Csv => written.extend(self.generate_delimited_reports(results, b',', "csv")?),
            ReportFormat::Json => written.extend(self.generate_json_reports(results)?),
            ReportFormat::Tsv => written.extend(self.generate_delimited_reports(results, b'\t', "tsv")?),
            ReportFormat::All => {
                written.extend(self.generate_json_reports(results)?);
                written.extend(self.generate_delimited_reports(results, b',', "csv")?);
                written.extend(self.generate_delimited_reports(results, b'\t', "tsv")?);
                written.push(self.generate_html_report(results)?);
            }
        }

        info!(
            "Wrote {} report files to {}",
            written.len(),
            self.output_dir.display()
        );
        Ok(written)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.output_dir.join(name);
        let json_content = to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {} to JSON", name))?;
        fs::write(&path, json_content)
            .with_context(|| format!("Failed to write JSON report to {}", path.display()))?;
        Ok(path)
    }

    fn generate_json_reports(&self, results: &MatchResults) -> Result<Vec<PathBuf>> {
        Ok(vec![
            self.write_json("summary.json", &ReportSummary::new(results))?,
            self.write_json("difference_scores.json", &results.difference_scoring)?,
            self.write_json("sas_scores.json", &results.sas_scores)?,
            self.write_json("eplets_found.json", &results.eplets_found)?,
            self.write_json("ranking.json", &results.ranking)?,
            self.write_json("alignment.json", &results.alignment)?,
        ])
    }

    fn writer(&self, name: &str, delimiter: u8) -> Result<(csv::Writer<fs::File>, PathBuf)> {
        let path = self.output_dir.join(name);
        let wtr = WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(&path)
            .with_context(|| format!("Failed to create writer for {}", path.display()))?;
        Ok((wtr, path))
    }

    fn generate_delimited_reports(
        &self,
        results: &MatchResults,
        delimiter: u8,
        ext: &str,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for class in &results.relevant_classes {
            written.push(self.write_mismatches(results, *class, delimiter, ext)?);
            written.push(self.write_eplets(results, *class, delimiter, ext)?);
            written.push(self.write_sas_scores(results, *class, delimiter, ext)?);
        }
        written.push(self.write_ranking(results, delimiter, ext)?);
        Ok(written)
    }

    fn write_mismatches(
        &self,
        results: &MatchResults,
        class: AlleleClass,
        delimiter: u8,
        ext: &str,
    ) -> Result<PathBuf> {
        let (mut wtr, path) = self.writer(&format!("mismatches_{}.{}", class, ext), delimiter)?;
        wtr.write_record([
            "recipient",
            "donor",
            "position",
            "donor_diff",
            "recip_diff",
            "updated_donor_diff",
            "updated_recip_diff",
        ])?;

        for (recipient_id, per_donor) in &results.difference_scoring {
            for (donor_id, classes) in per_donor {
                let Some(difference) = classes.get(&class) else {
                    continue;
                };
                let updated = difference.updated_mismatches().unwrap_or_default();
                let updated_recip = difference.updated_recip_mismatches().unwrap_or_default();

                for pos in 0..difference.len() {
                    let donor_diff = &difference.donor_diff[pos];
                    let recip_diff = &difference.recip_diff[pos];
                    if donor_diff.is_empty() && recip_diff.is_empty() {
                        continue;
                    }
                    wtr.write_record([
                        recipient_id.clone(),
                        donor_id.clone(),
                        (pos + 1).to_string(),
                        residues(donor_diff),
                        residues(recip_diff),
                        updated.get(pos).map(|m| residues(m)).unwrap_or_default(),
                        updated_recip.get(pos).map(|m| residues(m)).unwrap_or_default(),
                    ])?;
                }
            }
        }

        wtr.flush()?;
        Ok(path)
    }

    fn write_eplets(
        &self,
        results: &MatchResults,
        class: AlleleClass,
        delimiter: u8,
        ext: &str,
    ) -> Result<PathBuf> {
        let (mut wtr, path) = self.writer(&format!("eplets_{}.{}", class, ext), delimiter)?;
        wtr.write_record([
            "recipient",
            "donor",
            "direction",
            "eplet",
            "mismatch_position",
            "min_pos",
            "max_pos",
            "donor_alleles",
            "recipient_alleles",
            "motif",
        ])?;

        for (recipient_id, per_donor) in &results.eplets_found {
            for (donor_id, classes) in per_donor {
                let Some(found) = classes.get(&class) else {
                    continue;
                };
                for (direction, eplets) in [("donor", &found.donor_diff), ("recipient", &found.recip_diff)] {
                    for (eplet, hit) in eplets {
                        wtr.write_record([
                            recipient_id.clone(),
                            donor_id.clone(),
                            direction.to_string(),
                            eplet.clone(),
                            hit.mismatch_position.to_string(),
                            hit.min_pos.to_string(),
                            hit.max_pos.to_string(),
                            hit.donors.join(" "),
                            hit.recipients.join(" "),
                            motif_label(&hit.eplet_data),
                        ])?;
                    }
                }
            }
        }

        wtr.flush()?;
        Ok(path)
    }

    fn write_sas_scores(
        &self,
        results: &MatchResults,
        class: AlleleClass,
        delimiter: u8,
        ext: &str,
    ) -> Result<PathBuf> {
        let (mut wtr, path) = self.writer(&format!("sas_scores_{}.{}", class, ext), delimiter)?;
        wtr.write_record(["individual", "role", "position", "rsa", "asa", "total"])?;

        for individual in results.individuals.values() {
            let Some(scores) = results
                .sas_scores
                .get(&individual.id)
                .and_then(|classes| classes.get(&class))
            else {
                continue;
            };
            for (pos, score) in scores.iter().enumerate() {
                wtr.write_record([
                    individual.id.clone(),
                    individual.role.to_string(),
                    (pos + 1).to_string(),
                    score.rsa.map(|v| format!("{:.4}", v)).unwrap_or_default(),
                    score.asa.map(|v| format!("{:.4}", v)).unwrap_or_default(),
                    score.total.to_string(),
                ])?;
            }
        }

        wtr.flush()?;
        Ok(path)
    }

    fn write_ranking(&self, results: &MatchResults, delimiter: u8, ext: &str) -> Result<PathBuf> {
        let (mut wtr, path) = self.writer(&format!("ranking.{}", ext), delimiter)?;
        wtr.write_record([
            "recipient",
            "class",
            "rank",
            "donor",
            "score",
            "updated_score",
            "mismatches_donor",
            "mismatches_recip",
            "updated_mismatches_donor",
            "updated_mismatches_recip",
            "total_sequence_length",
        ])?;

        for (recipient_id, ranking) in &results.ranking {
            for (class, entries) in &ranking.scores {
                for (rank, entry) in entries.iter().enumerate() {
                    wtr.write_record([
                        recipient_id.clone(),
                        class.to_string(),
                        (rank + 1).to_string(),
                        entry.donor_id.clone(),
                        percent(entry.score),
                        percent(entry.updated_score),
                        entry.mismatches_donor.to_string(),
                        entry.mismatches_recip.to_string(),
                        entry.updated_mismatches_donor.to_string(),
                        entry.updated_mismatches_recip.to_string(),
                        entry.total_sequence_length.to_string(),
                    ])?;
                }
            }
        }

        wtr.flush()?;
        Ok(path)
    }

    fn generate_html_report(&self, results: &MatchResults) -> Result<PathBuf> {
        let path = self.output_dir.join("report.html");
        fs::write(&path, self.create_html_content(results))
            .with_context(|| format!("Failed to write HTML report to {}", path.display()))?;
        Ok(path)
    }

    fn create_html_content(&self, results: &MatchResults) -> String {
        let summary = ReportSummary::new(results);

        let mut html = format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>MHC Matching Report - {dataset}</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; background-color: #f5f5f5; }}
        .container {{ max-width: 1200px; margin: 0 auto; background-color: white; padding: 30px; border-radius: 10px; }}
        h1, h2, h3 {{ color: #2c3e50; }}
        table {{ width: 100%; border-collapse: collapse; margin: 20px 0; }}
        th, td {{ border: 1px solid #ddd; padding: 8px; text-align: left; }}
        th {{ background-color: #3498db; color: white; }}
        tr:nth-child(even) {{ background-color: #f2f2f2; }}
        .summary-box {{ background-color: #e8f4f8; padding: 20px; border-radius: 5px; margin: 20px 0; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>MHC Matching Report</h1>
        <p>Generated on: {generated_at}</p>
        <div class="summary-box">
            <h2>Summary</h2>
            <p><strong>Dataset:</strong> {dataset}</p>
            <p><strong>RSA threshold:</strong> {threshold}</p>
            <p><strong>Donors:</strong> {donors}</p>
            <p><strong>Recipients:</strong> {recipients}</p>
            <p><strong>Relevant classes:</strong> {classes}</p>
            <p><strong>Invalid alleles:</strong> {invalid}</p>
            <p><strong>Transformed alleles:</strong> {transformed}</p>
        </div>
"#,
            dataset = escape_html(summary.dataset),
            generated_at = summary.generated_at,
            threshold = summary.rsa_threshold,
            donors = escape_html(&summary.donors.join(", ")),
            recipients = escape_html(&summary.recipients.join(", ")),
            classes = summary
                .relevant_classes
                .iter()
                .map(AlleleClass::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            invalid = escape_html(&summary.invalid_alleles.join(", ")),
            transformed = escape_html(
                &summary
                    .transformed_alleles
                    .iter()
                    .map(|(from, to)| format!("{} -> {}", from, to))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        for (recipient_id, ranking) in &results.ranking {
            html.push_str(&format!(
                "<h2>Recipient {}</h2>\n",
                escape_html(recipient_id)
            ));
            for (class, entries) in &ranking.scores {
                html.push_str(&format!("<h3>Class {}</h3>\n<table>\n", class));
                html.push_str("<tr><th>Rank</th><th>Donor</th><th>Score</th><th>Filtered score</th><th>Mismatches</th><th>Filtered mismatches</th><th>Known eplets</th></tr>\n");
                for (rank, entry) in entries.iter().enumerate() {
                    let eplets = results
                        .eplets_found
                        .get(recipient_id)
                        .and_then(|donors| donors.get(&entry.donor_id))
                        .and_then(|classes| classes.get(class))
                        .map(|found| {
                            found
                                .donor_diff
                                .keys()
                                .chain(found.recip_diff.keys())
                                .cloned()
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default();
                    html.push_str(&format!(
                        "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                        rank + 1,
                        escape_html(&entry.donor_id),
                        percent(entry.score),
                        percent(entry.updated_score),
                        entry.mismatches_donor,
                        entry.updated_mismatches_donor,
                        escape_html(&eplets),
                    ));
                }
                html.push_str("</table>\n");
            }
        }

        html.push_str("    </div>\n</body>\n</html>\n");
        html
    }
}

fn residues(mismatch: &[char]) -> String {
    mismatch.iter().collect()
}

fn percent(score: Option<f64>) -> String {
    score.map(|s| format!("{:.2}", s)).unwrap_or_default()
}

/// `{2: 'A', 9: 'Y'}` -> `2A 9Y`
fn motif_label(motif: &BTreeMap<usize, char>) -> String {
    motif
        .iter()
        .map(|(pos, residue)| format!("{}{}", pos, residue))
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
