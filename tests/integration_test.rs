use mhc_matchmaker::eplets::motif_present;
use mhc_matchmaker::*;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

fn data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("data")
}

fn store() -> JsonAlleleStore {
    JsonAlleleStore::from_path(&data_dir().join("alleles.json"))
        .unwrap()
        .with_eplet_dir(&data_dir().join("eplets"))
        .unwrap()
}

fn individual(id: &str, role: Role, alleles: &[&str]) -> Individual {
    Individual::new(id, role, alleles.iter().map(|a| a.to_string()).collect())
}

fn dataset(individuals: Vec<Individual>) -> ParsedDataset {
    ParsedDataset::new("integration", individuals).unwrap()
}

#[test]
fn test_two_donors_one_recipient() {
    let store = store();
    let parsed = DatasetParser::new()
        .parse(&data_dir().join("dataset.csv"))
        .unwrap();
    assert_eq!(parsed.donor_count(), 2);

    let results = Matchmaker::new(&store, 0.25).run(parsed).unwrap();

    let d1 = &results.difference_scoring["R1"]["D1"][&AlleleClass::ClassI];
    let positions: Vec<usize> = d1
        .donor_diff
        .iter()
        .enumerate()
        .filter(|(_, diff)| !diff.is_empty())
        .map(|(pos, _)| pos + 1)
        .collect();
    assert_eq!(positions, vec![2, 9]);

    let d2 = &results.difference_scoring["R1"]["D2"];
    assert!(d2
        .values()
        .all(|difference| difference.donor_diff.iter().all(Vec::is_empty)));

    assert_eq!(
        results.relevant_classes,
        vec![AlleleClass::ClassI, AlleleClass::Drb]
    );

    let drb = &results.eplets_found["R1"]["D1"][&AlleleClass::Drb];
    assert!(drb.donor_diff.contains_key("7Y"));
    assert!(drb.recip_diff.contains_key("7F"));
    assert!(results.eplets_found["R1"]["D2"].is_empty());
}

#[test]
fn test_unresolvable_allele_is_dropped() {
    let store = store();
    let results = Matchmaker::new(&store, 0.25)
        .run(dataset(vec![
            individual("R1", Role::Recipient, &["A*02:01", "Z*99:99"]),
            individual("D1", Role::Donor, &["A*0101"]),
        ]))
        .unwrap();

    assert_eq!(results.audit.invalid_alleles, vec!["Z*99:99"]);
    assert_eq!(results.individuals["R1"].haplotype, vec!["A*02:01"]);
    assert_eq!(results.individuals["D1"].haplotype, vec!["A*01:01"]);
    assert_eq!(results.audit.transformed_alleles["A*0101"], "A*01:01");
    assert!(!results.alignment.contains_key("Z*99:99"));
}

#[test]
fn test_threshold_above_every_value_suppresses_all() {
    let store = store();
    let results = Matchmaker::new(&store, 0.95)
        .run(dataset(vec![
            individual("R1", Role::Recipient, &["A*02:01"]),
            individual("D1", Role::Donor, &["A*01:01"]),
        ]))
        .unwrap();

    let difference = &results.difference_scoring["R1"]["D1"][&AlleleClass::ClassI];
    assert!(difference
        .updated_mismatches()
        .unwrap()
        .iter()
        .all(Vec::is_empty));
    assert_eq!(difference.donor_diff_score, 2);
    // nothing left to match eplets against
    assert!(results.eplets_found["R1"]["D1"].is_empty());
}

#[test]
fn test_stages_run_in_order() {
    let store = store();
    let mut ctx = MatchContext::new(vec![
        Individual::new("R1", Role::Recipient, vec!["A*02:01".to_string()]),
        Individual::new("D1", Role::Donor, vec!["A*01:01".to_string()]),
    ]);

    assert!(matches!(
        DifferenceScorer::new().run(&mut ctx),
        Err(MatchError::StageOrder { .. })
    ));

    AlleleResolver::new(&store).run(&mut ctx).unwrap();
    HaplotypeClassifier::new().run(&mut ctx).unwrap();
    AlleleGrouper::new().run(&mut ctx).unwrap();
    DifferenceScorer::new().run(&mut ctx).unwrap();
    SasAverager::new().run(&mut ctx).unwrap();
    SasFilter::new(0.25).run(&mut ctx).unwrap();
    EpletMatcher::new(&store).run(&mut ctx).unwrap();
    assert_eq!(ctx.stage(), Stage::EpletsMatched);

    // re-filtering invalidates the eplet stage
    SasFilter::new(0.5).run(&mut ctx).unwrap();
    assert_eq!(ctx.stage(), Stage::Filtered);
    assert!(ctx.eplets_found().is_empty());
    assert_eq!(ctx.rsa_threshold(), Some(0.5));
}

#[test]
fn test_reported_eplets_are_sound() {
    let store = store();
    let results = Matchmaker::new(&store, 0.25)
        .run(dataset(vec![
            individual("R1", Role::Recipient, &["A*02:01", "DQA1*01:01", "DQB1*02:01", "DRB1*15:01"]),
            individual("D1", Role::Donor, &["A*01:01", "B*08:01", "DQA1*05:01", "DQB1*06:02", "DRB1*03:01"]),
        ]))
        .unwrap();

    let allele = |id: &str| store.find(id).unwrap().unwrap();
    let mut checked = 0;
    for (recipient_id, per_donor) in &results.eplets_found {
        for (donor_id, classes) in per_donor {
            for (class, found) in classes {
                let difference = &results.difference_scoring[recipient_id][donor_id][class];
                for (eplet, hit) in &found.donor_diff {
                    assert!(
                        hit.donors.iter().any(|id| motif_present(&allele(id).aligned_seq, &hit.eplet_data)),
                        "{eplet} not carried by any donor allele"
                    );
                    let mismatch = &difference.updated_mismatches().unwrap()[hit.mismatch_position - 1];
                    for id in &hit.recipients {
                        let residue = allele(id).residue_at(hit.mismatch_position).unwrap();
                        assert!(!mismatch.contains(&residue));
                    }
                    checked += 1;
                }
                for hit in found.recip_diff.values() {
                    assert!(hit
                        .recipients
                        .iter()
                        .any(|id| motif_present(&allele(id).aligned_seq, &hit.eplet_data)));
                    checked += 1;
                }
            }
        }
    }
    assert!(checked > 0);

    let dq = &results.eplets_found["R1"]["D1"];
    assert!(dq[&AlleleClass::Dqa].donor_diff.contains_key("6S"));
    assert!(dq[&AlleleClass::Dqb].donor_diff.contains_key("6Y"));
}

#[test]
fn test_gzipped_store_and_reports() -> anyhow::Result<()> {
    let temp_dir = tempfile::TempDir::new()?;
    let gz_path = temp_dir.path().join("alleles.json.gz");
    let mut encoder =
        flate2::write::GzEncoder::new(File::create(&gz_path)?, flate2::Compression::default());
    encoder.write_all(&fs::read(data_dir().join("alleles.json"))?)?;
    encoder.finish()?;

    let store = JsonAlleleStore::from_path(&gz_path)?.with_eplet_dir(&data_dir().join("eplets"))?;
    assert_eq!(store.len(), 16);

    let parsed = DatasetParser::new().parse(&data_dir().join("dataset.csv"))?;
    let results = Matchmaker::new(&store, 0.25).run(parsed)?;

    let out = temp_dir.path().join("reports");
    let written = ReportGenerator::new(&out)?.generate(&results, ReportFormat::All)?;
    for name in [
        "summary.json",
        "ranking.json",
        "mismatches_I.csv",
        "eplets_IIDRB.tsv",
        "sas_scores_I.csv",
        "ranking.tsv",
        "report.html",
    ] {
        assert!(written.contains(&out.join(name)), "{name} not written");
        assert!(out.join(name).is_file());
    }
    Ok(())
}

#[test]
fn test_invalid_datasets_are_rejected() {
    let parser = DatasetParser::new();
    let temp_dir = tempfile::TempDir::new().unwrap();

    let only_donors = temp_dir.path().join("donors.csv");
    fs::write(
        &only_donors,
        "identifier,type,haplotype\nD1,Donor,\"['A*01:01']\"\n",
    )
    .unwrap();
    assert!(matches!(parser.parse(&only_donors), Err(MatchError::Input(_))));

    let unknown = temp_dir.path().join("pairs.xlsx");
    fs::write(&unknown, "not a table").unwrap();
    assert!(parser.parse(&unknown).is_err());
}

#[test]
fn test_unclassifiable_allele_aborts_run() {
    let store = store();
    let err = Matchmaker::new(&store, 0.25)
        .run(dataset(vec![
            individual("R1", Role::Recipient, &["A*02:01", "DPB1*04:01"]),
            individual("D1", Role::Donor, &["A*01:01"]),
        ]))
        .unwrap_err();

    match err {
        MatchError::Unclassifiable { allele, locus, .. } => {
            assert_eq!(allele, "DPB1*04:01");
            assert_eq!(locus.as_deref(), Some("DPB1"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
