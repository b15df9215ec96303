#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use parcor::batch::PairBatchRunner;
use parcor::config::EngineConfig;
use parcor::data::{SampleAlignment, load_table};
use parcor::diagnostics::diagnose_all;
use parcor::io::{
    COMPARISON_FILE, RESULTS_FILE, RunSummary, SUMMARY_FILE, compare_results, read_results,
    write_comparison, write_json, write_results, write_summary,
};
use parcor::types::PairOutcome;

#[derive(Parser)]
#[command(
    name = "parcor",
    about = "Confounder-adjusted gene co-expression with bootstrap confidence intervals",
    long_about = "Computes simple and partial correlations for configured gene pairs, \
                 adjusting for named sets of confounders, and attaches percentile \
                 bootstrap confidence intervals computed in parallel."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured pair and write the results table and summary
    Run(RunArgs),
    /// Inspect covariate sets for collinearity before a run
    Diagnose(DiagnoseArgs),
    /// Compare two results tables unit by unit
    Compare(CompareArgs),
    /// Write a starting configuration file
    Template {
        /// Destination of the TOML file
        #[arg(default_value = "parcor.toml")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Expression table (CSV/TSV, optionally .gz): samples × genes
    #[arg(long)]
    expression: PathBuf,

    /// Confounder table (CSV/TSV, optionally .gz): samples × confounders
    #[arg(long)]
    confounders: PathBuf,

    /// TOML run configuration
    #[arg(long)]
    config: PathBuf,

    /// Directory for the results table and summary
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Worker threads for the bootstrap (overrides the configuration)
    #[arg(long)]
    threads: Option<usize>,

    /// Base random seed (overrides the configuration)
    #[arg(long)]
    seed: Option<u64>,

    /// Bootstrap trials per unit (overrides the configuration)
    #[arg(long)]
    trials: Option<usize>,

    /// Bootstrap time limit per unit in seconds (overrides the configuration)
    #[arg(long)]
    timeout: Option<f64>,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct DiagnoseArgs {
    /// Confounder table (CSV/TSV, optionally .gz)
    #[arg(long)]
    confounders: PathBuf,

    /// TOML run configuration naming the covariate sets
    #[arg(long)]
    config: PathBuf,

    /// Restrict to samples present in this expression table
    #[arg(long)]
    expression: Option<PathBuf>,

    /// Destination of the JSON report
    #[arg(long, default_value = "covariate_diagnostics.json")]
    out: PathBuf,
}

#[derive(Args)]
struct CompareArgs {
    /// Results table from the earlier run
    baseline: PathBuf,

    /// Results table from the later run
    current: PathBuf,

    /// Destination of the comparison table
    #[arg(long, default_value = COMPARISON_FILE)]
    out: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Diagnose(args)) => diagnose(args),
        Some(Commands::Compare(args)) => compare(args),
        Some(Commands::Template { out }) => template(&out),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<EngineConfig, Box<dyn Error>> {
    let config = EngineConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

fn run(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = EngineConfig::load(&args.config)?;
    if let Some(threads) = args.threads {
        config.threads = Some(threads);
    }
    if let Some(seed) = args.seed {
        config.random_seed = seed;
    }
    if let Some(trials) = args.trials {
        config.trial_count = trials;
    }
    if let Some(seconds) = args.timeout {
        config.timeout_seconds = Some(seconds);
    }
    config.validate()?;

    let expression = load_table(
        &args.expression,
        &config.sample_id_columns,
        Some(config.required_gene_columns().as_slice()),
    )?;
    let confounders = load_table(
        &args.confounders,
        &config.sample_id_columns,
        Some(config.required_confounders().as_slice()),
    )?;

    let mut runner = PairBatchRunner::new(&config, &expression, &confounders)?;
    if !args.quiet {
        let bar = ProgressBar::new(config.units().len() as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )?
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        runner = runner.with_progress(bar);
    }

    println!(
        "Analysing {} units over {} aligned samples ({} trials, seed {}, {} threads)",
        config.units().len(),
        runner.alignment().len(),
        config.trial_count,
        config.random_seed,
        runner.threads()
    );
    let report = runner.run();

    fs::create_dir_all(&args.out_dir)?;
    let results_path = args.out_dir.join(RESULTS_FILE);
    let summary_path = args.out_dir.join(SUMMARY_FILE);
    write_results(&results_path, &report.outcomes)?;
    let summary = RunSummary::new(
        &report,
        &config,
        expression.n_samples(),
        confounders.n_samples(),
    );
    write_summary(&summary_path, &summary)?;

    println!("\nKey findings:");
    for outcome in &report.outcomes {
        match outcome {
            PairOutcome::Completed(r) => println!(
                "  {}-{} [{}]: r {:.3} -> {:.3} ({:.0}% CI {:.3} to {:.3}{}), attenuation {:.1}%",
                r.gene1,
                r.gene2,
                r.covariate_set,
                r.simple.r,
                r.partial.r,
                r.interval.level * 100.0,
                r.interval.lower,
                r.interval.upper,
                if r.interval.degraded { ", degraded" } else { "" },
                r.attenuation_pct
            ),
            PairOutcome::Skipped(s) => println!(
                "  {}-{} [{}]: skipped during {} ({})",
                s.gene1, s.gene2, s.covariate_set, s.stage, s.reason_code
            ),
        }
    }
    println!(
        "\n{} completed, {} skipped in {:.2}s",
        summary.completed, summary.skipped, summary.elapsed_seconds
    );
    println!("Results written to '{}'", results_path.display());
    println!("Summary written to '{}'", summary_path.display());
    Ok(())
}

fn diagnose(args: DiagnoseArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.config)?;
    let confounders = load_table(
        &args.confounders,
        &config.sample_id_columns,
        Some(config.required_confounders().as_slice()),
    )?;
    let alignment = match &args.expression {
        Some(path) => {
            let no_columns: &[String] = &[];
            let expression = load_table(path, &config.sample_id_columns, Some(no_columns))?;
            SampleAlignment::new(&expression, &confounders)
        }
        None => SampleAlignment::new(&confounders, &confounders),
    };

    let reports = diagnose_all(&alignment, &confounders, &config);
    for report in &reports {
        let condition = report
            .condition_number
            .map_or("n/a".to_string(), |c| format!("{c:.3e}"));
        println!(
            "{}: {} confounders over {} complete samples, condition number {}{}",
            report.name,
            report.confounders.len(),
            report.n_complete,
            condition,
            if report.collinear { " (COLLINEAR)" } else { "" }
        );
        for (name, reason) in &report.dropped {
            println!("  dropped {name}: {reason}");
        }
        for (a, b, r) in &report.highly_correlated {
            println!("  {a} ~ {b}: r = {r:.3}");
        }
    }

    write_json(&args.out, &reports)?;
    println!("Diagnostics written to '{}'", args.out.display());
    Ok(())
}

fn compare(args: CompareArgs) -> Result<(), Box<dyn Error>> {
    let baseline = read_results(&args.baseline)?;
    let current = read_results(&args.current)?;
    let rows = compare_results(&baseline, &current);
    write_comparison(&args.out, &rows)?;

    let largest = rows
        .iter()
        .filter_map(|row| row.r_difference.map(|d| (row, d)))
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()));
    println!(
        "{} matching units ({} baseline, {} current)",
        rows.len(),
        baseline.len(),
        current.len()
    );
    if let Some((row, difference)) = largest {
        println!(
            "Largest shift: {}-{} [{}] by {difference:+.4}",
            row.gene1, row.gene2, row.covariate_set
        );
    }
    println!("Comparison written to '{}'", args.out.display());
    Ok(())
}

fn template(out: &Path) -> Result<(), Box<dyn Error>> {
    EngineConfig::study_template().save(out)?;
    println!("Template configuration written to '{}'", out.display());
    Ok(())
}
