use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use iobench_runner::{SweepOptions, SweepReport, SweepSummary};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const COLOR_GREEN: &str = "\x1b[1;32m";
const COLOR_END: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "iobench", version = "0.1.0", about = "GPU dataframe I/O benchmark sweep harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full reader sweep declared in a plan file
    Run {
        plan: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        stop_on_failure: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run the profiling sweep: each point wrapped in nsys, traces exported to sqlite
    Profile {
        plan: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        stop_on_failure: bool,
        #[arg(long)]
        json: bool,
    },
    /// Summarise a plan without running anything
    Describe {
        plan: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a sweep.yaml template into the current directory
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok").and_then(Value::as_bool) == Some(false) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            plan,
            dry_run,
            stop_on_failure,
            json,
        } => {
            let plan = iobench_runner::load_plan(&plan)?;
            let opts = SweepOptions {
                dry_run,
                stop_on_failure,
            };
            let report = iobench_runner::run_sweep(&plan, &opts)?;
            if json {
                return Ok(Some(report_to_json("run", &report)));
            }
            print_report(&report);
            fail_on_report_errors(&report)?;
        }
        Commands::Profile {
            plan,
            dry_run,
            stop_on_failure,
            json,
        } => {
            let plan = iobench_runner::load_plan(&plan)?;
            let opts = SweepOptions {
                dry_run,
                stop_on_failure,
            };
            let report = iobench_runner::run_profile_sweep(&plan, &opts)?;
            if json {
                return Ok(Some(report_to_json("profile", &report)));
            }
            print_report(&report);
            fail_on_report_errors(&report)?;
        }
        Commands::Describe { plan, json } => {
            let plan = iobench_runner::load_plan(&plan)?;
            iobench_runner::validate_plan(&plan)?;
            let summary = iobench_runner::describe_plan(&plan);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Init { force } => {
            let path = std::env::current_dir()?.join("sweep.yaml");
            if !force && path.exists() {
                return Err(anyhow!(format!(
                    "plan file already exists (use --force): {}",
                    path.display()
                )));
            }

            let plan_yaml = "\
version: '0.1'
sweep:
  id: ''                              # REQUIRED
harness:
  bench_dir: ''                       # REQUIRED: directory containing the *_NVBENCH binaries
  output_dir: ''                      # REQUIRED: logs and traces land here as <run name>.<ext>
  device: 0
  min_samples: 40
  # timeout_secs: 60
env:                                  # forwarded verbatim to every benchmark process
  TMPDIR: /tmp
  KVIKIO_COMPAT_MODE: 'on'
  # LIBCUDF_CUFILE_POLICY: KVIKIO
  # CUFILE_LOGFILE_PATH: placeholder  # rewritten per run to <output_dir>/<run name>.txt
directives:
  name_prefix: ''
  output_csv: false
  dry_run: false
axes:
  kinds: [parquet, orc, json, csv]    # also available: parquet-small-mixed
  cache: [hot, cold]
  threads: []                         # e.g. [1, 8]
  cardinalities: []                   # e.g. [0, 1000]
profile:
  nsys_bin: nsys
  gpu_metrics_device: 0
  min_samples: 20
  compression: SNAPPY
";
            std::fs::write(&path, plan_yaml)?;
            println!("wrote: {}", path.display());
            println!("next: edit sweep.yaml \u{2014} fill in all fields marked REQUIRED");
            println!("next: iobench describe sweep.yaml");
        }
    }
    Ok(None)
}

fn fail_on_report_errors(report: &SweepReport) -> Result<()> {
    if report.ok() {
        return Ok(());
    }
    Err(anyhow!(
        "{} of {} sweep points failed",
        report.failures().len(),
        report.points.len()
    ))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Profile { json, .. }
        | Commands::Describe { json, .. } => *json,
        _ => false,
    }
}

fn report_to_json(command: &str, report: &SweepReport) -> Value {
    json!({
        "ok": report.ok(),
        "command": command,
        "sweep": report.sweep_id,
        "started_at": report.started_at,
        "finished_at": report.finished_at,
        "points": report.points.iter().map(|p| json!({
            "name": p.name,
            "kind": p.kind.tag(),
            "status": p.status.to_string(),
            "failed": p.status.is_failure(),
        })).collect::<Vec<_>>(),
        "failed": report.failures().len(),
    })
}

fn summary_to_json(summary: &SweepSummary) -> Value {
    json!({
        "sweep": summary.sweep_id,
        "bench_dir": summary.bench_dir.display().to_string(),
        "output_dir": summary.output_dir.display().to_string(),
        "kinds": summary.kinds,
        "cache": summary.cache,
        "threads": summary.threads,
        "cardinalities": summary.cardinalities,
        "name_prefix": summary.name_prefix,
        "output_csv": summary.output_csv,
        "dry_run": summary.dry_run,
        "profile": summary.has_profile,
        "total_points": summary.total_points,
        "names": summary.names
    })
}

fn print_report(report: &SweepReport) {
    println!("sweep: {}", report.sweep_id);
    println!("started_at: {}", report.started_at);
    println!("finished_at: {}", report.finished_at);
    for point in &report.points {
        println!(
            "{}--> {}{} {}",
            COLOR_GREEN, point.name, COLOR_END, point.status
        );
    }
    println!("points: {}", report.points.len());
    let failures = report.failures();
    println!("failed: {}", failures.len());
    if !failures.is_empty() {
        println!("failures:");
        for point in failures {
            println!("  {}: {}", point.name, point.status);
        }
    }
}

fn print_summary(summary: &SweepSummary) {
    println!("sweep: {}", summary.sweep_id);
    println!("bench_dir: {}", summary.bench_dir.display());
    println!("output_dir: {}", summary.output_dir.display());
    println!("kinds: {:?}", summary.kinds);
    println!("cache: {:?}", summary.cache);
    println!("threads: {:?}", summary.threads);
    println!("cardinalities: {:?}", summary.cardinalities);
    if let Some(prefix) = &summary.name_prefix {
        println!("name_prefix: {}", prefix);
    }
    println!("output_csv: {}", summary.output_csv);
    println!("dry_run: {}", summary.dry_run);
    println!("profile: {}", summary.has_profile);
    println!("total_points: {}", summary.total_points);
    for name in &summary.names {
        println!("  {}", name);
    }
}
