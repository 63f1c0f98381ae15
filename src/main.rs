mod container;
mod executor;
mod loader;
mod nifti;
mod outcome;
mod prepare;
mod report;
mod scheduler;
mod schema;
mod vars;

use clap::{Parser, Subcommand};
use report::ResultSink;
use scheduler::{RunOptions, RunState};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "sifter")]
#[command(about = "A declarative test runner for Apptainer/Singularity container images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute test suites
    Run {
        /// Suite files to run (default: every suite in the tests directory)
        suites: Vec<String>,
        /// Number of parallel workers (1 = sequential)
        #[arg(short, long, default_value_t = 1)]
        jobs: usize,
        /// Directory containing container images
        #[arg(short, long, default_value = "containers")]
        containers_dir: PathBuf,
        /// Directory containing suite files
        #[arg(short, long, default_value = "tests")]
        tests_dir: PathBuf,
        /// Working directory for test execution (created if absent)
        #[arg(short, long, default_value = "work")]
        work_dir: PathBuf,
        /// Filter tests by name (case-insensitive regex)
        #[arg(short, long)]
        filter: Option<String>,
        /// Hide individual test results (only show the summary)
        #[arg(short, long)]
        quiet: bool,
        /// Only show failed tests
        #[arg(long)]
        failed_only: bool,
        /// Write an aggregate summary JSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write a line-oriented test log
        #[arg(long, default_value = "test_results.log")]
        log: PathBuf,
        /// Disable the log file
        #[arg(long)]
        no_log: bool,
        /// Write streaming results to a JSONL file
        #[arg(long, default_value = "test_results.jsonl")]
        jsonl: PathBuf,
        /// Disable the JSONL stream
        #[arg(long)]
        no_jsonl: bool,
    },
    /// List discoverable suite files
    List {
        /// Directory containing suite files
        #[arg(short, long, default_value = "tests")]
        tests_dir: PathBuf,
    },
    /// Parse suite files without running them
    Validate {
        /// Path to suite files (file or directory)
        path: PathBuf,
    },
    /// Scaffold a new suite file
    Init {
        /// Output path for the new suite file
        #[arg(default_value = "tests/example.yaml")]
        path: PathBuf,
    },
    /// Output the suite document schema
    Schema,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SIFTER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run {
            suites,
            jobs,
            containers_dir,
            tests_dir,
            work_dir,
            filter,
            quiet,
            failed_only,
            output,
            log,
            no_log,
            jsonl,
            no_jsonl,
        } => cmd_run(RunArgs {
            suites,
            jobs,
            containers_dir,
            tests_dir,
            work_dir,
            filter,
            quiet,
            failed_only,
            output,
            log: (!no_log).then_some(log),
            jsonl: (!no_jsonl).then_some(jsonl),
        }),
        Command::List { tests_dir } => cmd_list(&tests_dir),
        Command::Validate { path } => cmd_validate(&path),
        Command::Init { path } => cmd_init(&path),
        Command::Schema => cmd_schema(),
    };
    std::process::exit(code);
}

struct RunArgs {
    suites: Vec<String>,
    jobs: usize,
    containers_dir: PathBuf,
    tests_dir: PathBuf,
    work_dir: PathBuf,
    filter: Option<String>,
    quiet: bool,
    failed_only: bool,
    output: Option<PathBuf>,
    log: Option<PathBuf>,
    jsonl: Option<PathBuf>,
}

fn cmd_run(args: RunArgs) -> i32 {
    let filter = match args.filter.as_deref() {
        None => None,
        Some(pattern) => match regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
        {
            Ok(re) => Some(re),
            Err(e) => {
                eprintln!("Invalid filter pattern: {e}");
                return 1;
            }
        },
    };

    if let Err(e) = fs::create_dir_all(&args.work_dir) {
        eprintln!(
            "Error creating work directory {}: {e}",
            args.work_dir.display()
        );
        return 1;
    }
    // Test commands run with the work directory as their cwd, so relative
    // script and image paths would dangle; anchor both directories first.
    let work_dir = match args.work_dir.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            eprintln!(
                "Error resolving work directory {}: {e}",
                args.work_dir.display()
            );
            return 1;
        }
    };
    let containers_dir = args
        .containers_dir
        .canonicalize()
        .unwrap_or_else(|_| args.containers_dir.clone());

    let suite_paths = if args.suites.is_empty() {
        match loader::find_suites(&args.tests_dir) {
            Ok(paths) => paths,
            Err(e) => {
                eprintln!("Error finding suites in {}: {e}", args.tests_dir.display());
                return 1;
            }
        }
    } else {
        match loader::resolve_suite_args(&args.suites, &args.tests_dir) {
            Ok(paths) => paths,
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        }
    };

    if suite_paths.is_empty() {
        eprintln!("No suite files found in {}", args.tests_dir.display());
        return 1;
    }

    let mut sinks: Vec<Box<dyn ResultSink>> = Vec::new();
    if !args.quiet {
        sinks.push(Box::new(report::ConsoleSink {
            failed_only: args.failed_only,
        }));
    }
    if let Some(path) = &args.jsonl {
        match report::JsonlSink::create(path) {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(e) => {
                eprintln!("Error opening {}: {e}", path.display());
                return 1;
            }
        }
    }
    if sinks.is_empty() {
        sinks.push(Box::new(report::NullSink));
    }
    let sink = report::MultiSink::new(sinks);

    println!(
        "Running {} suite(s) | workers: {} | filter: {}",
        suite_paths.len(),
        args.jobs,
        args.filter.as_deref().unwrap_or("none")
    );

    let opts = RunOptions {
        jobs: args.jobs,
        filter,
        containers_dir,
        work_dir,
    };
    let state = RunState::new();
    let run_start = Instant::now();
    let results = scheduler::run_suites(&suite_paths, &opts, &state, &sink);
    let total_duration = run_start.elapsed();

    // Per-suite summary lines.
    println!();
    for suite in &results {
        let status = if suite.failed == 0 { "PASS" } else { "FAIL" };
        println!(
            "{status} {}: {}/{} tests passed ({:.1}s)",
            suite.name,
            suite.passed,
            suite.total,
            suite.duration.as_secs_f64()
        );
    }

    // Failed test details.
    let failed_total = scheduler::total_failed(&results);
    if failed_total > 0 {
        println!("\nFailed tests:");
        for suite in &results {
            for test in suite.results.iter().filter(|t| !t.passed) {
                println!("  {} > {}", suite.name, test.name);
                println!("    {}", test.message);
            }
        }
    }

    let (_, passed, failed) = state.counts();
    let suites_failed = results.iter().filter(|s| s.failed > 0).count();
    println!(
        "\nSuites: {} passed, {} failed ({} total)",
        results.len() - suites_failed,
        suites_failed,
        results.len()
    );
    println!("Tests:  {passed} passed, {failed} failed");
    println!("Time:   {:.1}s", total_duration.as_secs_f64());

    if let Some(path) = &args.output {
        if let Err(e) = report::write_summary_json(path, &results, total_duration) {
            eprintln!("Error writing {}: {e}", path.display());
            return 1;
        }
        println!("Results written to {}", path.display());
    }

    if let Some(path) = &args.log {
        if let Err(e) = report::write_log(path, &results, total_duration) {
            eprintln!("Error writing {}: {e}", path.display());
            return 1;
        }
    }

    if failed_total > 0 { 1 } else { 0 }
}

fn cmd_list(tests_dir: &Path) -> i32 {
    let suites = match loader::find_suites(tests_dir) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error finding suites in {}: {e}", tests_dir.display());
            return 1;
        }
    };

    println!("Available suite files (in {}):", tests_dir.display());
    for path in &suites {
        println!("  {}", path.display());
    }
    println!("\nTotal: {} files", suites.len());
    0
}

fn cmd_validate(path: &Path) -> i32 {
    let suites = match loader::find_suites(path) {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error finding suites: {e}");
            return 1;
        }
    };

    if suites.is_empty() {
        eprintln!("No suite files found at: {}", path.display());
        return 1;
    }

    let mut errors = 0;
    for suite_path in &suites {
        match loader::load_suite(suite_path) {
            Ok(suite) => {
                println!(
                    "ok {} ({} tests)",
                    suite_path.display(),
                    suite.definition.tests.len()
                );
            }
            Err(e) => {
                eprintln!("error {}: {e}", suite_path.display());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} suite(s) failed validation");
        return 1;
    }
    println!("\nAll {} suite(s) valid", suites.len());
    0
}

fn cmd_init(path: &Path) -> i32 {
    let template = r#"name: example
container: mytool_1.0.0.simg
default_timeout: 120

test_data:
  input: data/input.nii.gz
  output_dir: output/example

# env_setup: |
#   export OMP_NUM_THREADS=1

tests:
  - name: version banner
    command: mytool --version
    expected_output_contains: "1.0"

  - name: smooth volume
    command: mytool smooth ${input} ${output_dir}/smoothed.nii.gz
    validate:
      - output_exists: ${output_dir}/smoothed.nii.gz
      - same_dimensions: ["${input}", "${output_dir}/smoothed.nii.gz"]

  - name: rejects missing arguments
    command: mytool smooth
    expected_exit_code_not: 0

# cleanup:
#   script: rm -rf scratch
"#;

    if path.exists() {
        eprintln!("Error: file already exists: {}", path.display());
        return 1;
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && let Err(e) = fs::create_dir_all(parent)
    {
        eprintln!("Error creating directory: {e}");
        return 1;
    }
    if let Err(e) = fs::write(path, template) {
        eprintln!("Error writing file: {e}");
        return 1;
    }
    println!("Created: {}", path.display());
    0
}

fn cmd_schema() -> i32 {
    let schema = schema::generate_schema();
    let json = serde_json::to_string_pretty(&schema).expect("Failed to serialize schema");
    println!("{json}");
    0
}
