use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{generate, Shell};
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use mhc_matchmaker::{
    AlleleClass, AlleleDatabase, AlleleResolver, DatasetDiscovery, DatasetParser, Individual,
    JsonAlleleStore, MatchConfig, MatchContext, Matchmaker, ReportFormat, ReportGenerator, Role,
};

/// Donor/recipient MHC mismatch and eplet analysis
#[derive(Parser, Debug)]
#[command(
    name = "mhc-matchmaker",
    version,
    about = "MHC/HLA donor-recipient compatibility analysis",
    long_about = r#"
Compares donor and recipient HLA haplotypes position by position:
- resolves allele names against a reference store
- computes class-wise residue mismatches for every recipient/donor pair
- filters mismatches at buried positions using solvent accessibility
- reports known eplets and ranks donors for every recipient

Input datasets are CSV, TSV or JSON files (optionally gzipped).
"#
)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Dataset files or directories (supports tab completion)
    #[arg(value_name = "INPUTS", num_args = 0.., value_hint = ValueHint::AnyPath)]
    inputs: Vec<PathBuf>,

    /// Allele reference store (JSON, optionally gzipped)
    #[arg(short, long, global = true, env = "MHC_DATABASE", value_hint = ValueHint::FilePath)]
    database: Option<PathBuf>,

    /// Directory with eplets_I.json, eplets_DQ.json and eplets_DRB.json
    #[arg(short, long, global = true, env = "MHC_EPLETS_DIR", value_hint = ValueHint::DirPath)]
    eplets_dir: Option<PathBuf>,

    /// RSA threshold below which mismatches are treated as buried
    #[arg(long, value_name = "THRESHOLD")]
    rsa: Option<f64>,

    /// TOML configuration file
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Recursive search for dataset files
    #[arg(short, long, help = "Recursively search directories")]
    recursive: bool,

    /// Interactive mode with prompts for all parameters
    #[arg(short, long, help = "Interactive mode with default values")]
    interactive: bool,

    /// Number of threads (0 = auto-detect)
    #[arg(short, long, help = "Number of threads (0 = auto)")]
    threads: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,

    /// Output directory for reports
    #[arg(short, long, value_hint = ValueHint::DirPath)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Generate shell completions
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate shell completions
    Completions { shell: Shell },
    /// Resolve an allele name and print its reference record
    Lookup { allele: String },
    /// Tag every allele of the reference store with the known eplets it carries
    AnnotateEplets {
        /// Where to write the annotated store
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: PathBuf,
    },
    /// List allele classes and their eplet dictionaries
    Classes,
}

#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    Html,
    Csv,
    #[default]
    Json,
    Tsv,
    All,
}

impl From<OutputFormat> for ReportFormat {
    fn from(format: OutputFormat) -> ReportFormat {
        match format {
            OutputFormat::Html => ReportFormat::Html,
            OutputFormat::Csv => ReportFormat::Csv,
            OutputFormat::Json => ReportFormat::Json,
            OutputFormat::Tsv => ReportFormat::Tsv,
            OutputFormat::All => ReportFormat::All,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle shell completions
    if let Some(shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    if let Some(Commands::Completions { shell }) = cli.command {
        generate_completions(shell);
        return Ok(());
    }

    if let Some(Commands::Classes) = cli.command {
        list_classes();
        return Ok(());
    }

    init_logging(cli.verbose);

    let mut config = load_config(&cli)?;

    match &cli.command {
        Some(Commands::Lookup { allele }) => return lookup(&config, allele),
        Some(Commands::AnnotateEplets { output }) => return annotate_eplets(&config, output),
        _ => {}
    }

    let (inputs, recursive) = if cli.interactive {
        run_interactive_mode(&mut config)?
    } else {
        (cli.inputs.clone(), cli.recursive)
    };
    config.validate()?;

    if inputs.is_empty() {
        anyhow::bail!("No input datasets given");
    }

    init_thread_pool(config.effective_threads())?;

    info!("Starting MHC matching...");
    info!("Using {} threads", rayon::current_num_threads());

    run_matching(&config, &inputs, recursive)
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

fn list_classes() {
    println!("{}", style("Allele classes:").bold().cyan());
    println!();

    for class in AlleleClass::ALL {
        let eplets = class
            .eplet_family()
            .map(|family| family.file_name().to_string())
            .unwrap_or_else(|| "no known eplets".to_string());
        println!(
            "  {} - {}",
            style(class.as_str()).green().bold(),
            style(eplets).yellow()
        );
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(format!("mhc_matchmaker={}", level))
        .init();
}

fn init_thread_pool(threads: usize) -> Result<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .map_err(|e| anyhow::anyhow!("Failed to initialize thread pool: {}", e))?;

    Ok(())
}

/// Config file values, overridden by any flag given on the command line
fn load_config(cli: &Cli) -> Result<MatchConfig> {
    let mut config = match &cli.config {
        Some(path) => MatchConfig::from_toml_file(path)?,
        None => MatchConfig::default(),
    };

    if let Some(rsa) = cli.rsa {
        config.rsa_threshold = rsa;
    }
    if let Some(database) = &cli.database {
        config.database = Some(database.clone());
    }
    if let Some(eplets_dir) = &cli.eplets_dir {
        config.eplets_dir = Some(eplets_dir.clone());
    }
    if let Some(output) = &cli.output {
        config.output = output.clone();
    }
    if let Some(format) = cli.format {
        config.format = format.into();
    }
    if let Some(threads) = cli.threads {
        config.threads = threads;
    }

    Ok(config)
}

fn load_store(config: &MatchConfig) -> Result<JsonAlleleStore> {
    let path = config
        .database
        .as_deref()
        .context("No allele database given (use --database or set it in the config file)")?;
    let mut store = JsonAlleleStore::from_path(path)?;

    match &config.eplets_dir {
        Some(dir) => store = store.with_eplet_dir(dir)?,
        None => warn!("No eplet directory given, known eplets will not be reported"),
    }

    Ok(store)
}

fn lookup(config: &MatchConfig, allele: &str) -> Result<()> {
    let store = load_store(config)?;

    let mut ctx = MatchContext::new(vec![Individual::new(
        "lookup",
        Role::Recipient,
        vec![allele.to_string()],
    )]);
    AlleleResolver::new(&store).run(&mut ctx)?;

    let Some(resolved) = ctx
        .individual("lookup")
        .and_then(|individual| individual.haplotype.first())
    else {
        anyhow::bail!("Allele {} not found in database and no similar allele found", allele);
    };
    let record = ctx.allele(resolved)?;
    let class = store
        .allele_class(resolved)
        .map(|class| class.to_string())
        .ok();

    let output = serde_json::json!({
        "query": allele,
        "resolved": resolved,
        "class": class,
        "allele": record,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn annotate_eplets(config: &MatchConfig, output: &Path) -> Result<()> {
    if config.eplets_dir.is_none() {
        anyhow::bail!("annotate-eplets needs --eplets-dir");
    }
    let mut store = load_store(config)?;
    let annotated = store.annotate_eplets();
    store.write_json(output)?;

    println!(
        "{} {} of {} alleles carry known eplets, written to {}",
        style("✓").green().bold(),
        annotated,
        store.len(),
        style(output.display()).cyan()
    );
    Ok(())
}

fn run_interactive_mode(config: &mut MatchConfig) -> Result<(Vec<PathBuf>, bool)> {
    println!(
        "{}",
        style("╔══════════════════════════════════════════════════════════════╗").cyan()
    );
    println!(
        "{}",
        style("║          MHC Matchmaker - Interactive Mode                   ║")
            .cyan()
            .bold()
    );
    println!(
        "{}",
        style("╚══════════════════════════════════════════════════════════════╝").cyan()
    );
    println!();

    let theme = ColorfulTheme::default();

    let inputs: String = Input::with_theme(&theme)
        .with_prompt("Dataset files/directories (space-separated)")
        .interact_text()?;
    let inputs: Vec<PathBuf> = inputs.split_whitespace().map(PathBuf::from).collect();

    let recursive = Confirm::with_theme(&theme)
        .with_prompt("Enable recursive directory search?")
        .default(false)
        .interact()?;

    let database: String = Input::with_theme(&theme)
        .with_prompt("Allele reference store")
        .with_initial_text(path_text(config.database.as_deref()))
        .interact_text()?;
    config.database = Some(PathBuf::from(database));

    let eplets_dir: String = Input::with_theme(&theme)
        .with_prompt("Eplet directory (empty to skip)")
        .with_initial_text(path_text(config.eplets_dir.as_deref()))
        .allow_empty(true)
        .interact_text()?;
    config.eplets_dir = if eplets_dir.trim().is_empty() {
        None
    } else {
        Some(PathBuf::from(eplets_dir))
    };

    config.rsa_threshold = Input::with_theme(&theme)
        .with_prompt("RSA threshold")
        .default(config.rsa_threshold)
        .interact_text()?;

    let formats = ["JSON", "CSV", "TSV", "HTML", "All formats"];
    let format_idx = Select::with_theme(&theme)
        .with_prompt("Select output format")
        .default(0)
        .items(&formats)
        .interact()?;

    config.format = match format_idx {
        0 => ReportFormat::Json,
        1 => ReportFormat::Csv,
        2 => ReportFormat::Tsv,
        3 => ReportFormat::Html,
        4 => ReportFormat::All,
        _ => ReportFormat::Json,
    };

    let output: String = Input::with_theme(&theme)
        .with_prompt("Output directory")
        .default(config.output.display().to_string())
        .interact_text()?;
    config.output = PathBuf::from(output);

    config.threads = Input::with_theme(&theme)
        .with_prompt("Number of threads (0 = auto-detect)")
        .default(config.threads)
        .interact_text()?;

    Ok((inputs, recursive))
}

fn path_text(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

fn run_matching(config: &MatchConfig, inputs: &[PathBuf], recursive: bool) -> Result<()> {
    let store = load_store(config)?;

    let datasets = DatasetDiscovery::new(recursive).discover(inputs)?;
    if datasets.is_empty() {
        anyhow::bail!("No dataset files found");
    }
    info!("Found {} datasets to match", datasets.len());

    let pb = ProgressBar::new(datasets.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message("Matching donors and recipients...");

    // One independent pipeline per dataset; only the store is shared
    let outcomes: Vec<(PathBuf, Result<PathBuf>)> = datasets
        .par_iter()
        .map(|path| {
            let outcome = match_dataset(&store, config, path);
            pb.inc(1);
            (path.clone(), outcome)
        })
        .collect();

    pb.finish_with_message("Matching complete!");

    let mut failed = 0;
    for (path, outcome) in &outcomes {
        match outcome {
            Ok(report_dir) => println!(
                "{} {} -> {}",
                style("✓").green().bold(),
                path.display(),
                style(report_dir.display()).cyan()
            ),
            Err(e) => {
                failed += 1;
                println!(
                    "{} {}: {:#}",
                    style("✗").red().bold(),
                    path.display(),
                    e
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} datasets failed", failed, outcomes.len());
    }
    Ok(())
}

fn match_dataset(store: &dyn AlleleDatabase, config: &MatchConfig, path: &Path) -> Result<PathBuf> {
    let dataset = DatasetParser::new()
        .parse(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let report_dir = config.output.join(&dataset.name);

    let results = Matchmaker::new(store, config.rsa_threshold)
        .run(dataset)
        .with_context(|| format!("Matching failed for {}", path.display()))?;

    if !results.audit.invalid_alleles.is_empty() {
        warn!(
            "{}: dropped unknown alleles {}",
            path.display(),
            results.audit.invalid_alleles.join(", ")
        );
    }

    ReportGenerator::new(&report_dir)?.generate(&results, config.format)?;
    Ok(report_dir)
}
