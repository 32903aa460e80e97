use anyhow::Result;
use chrono::Utc;
use iobench_core::{directive, env_keys, run_name, BenchKind, CacheState, ConfigSet, HarnessError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct SweepPlan {
    pub version: String,
    pub sweep: SweepMeta,
    pub harness: HarnessSettings,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub directives: PlanDirectives,
    #[serde(default)]
    pub axes: Axes,
    #[serde(default)]
    pub profile: Option<ProfileSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepMeta {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarnessSettings {
    pub bench_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub device: u32,
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanDirectives {
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub output_csv: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub compression: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Axes {
    #[serde(default = "default_kinds")]
    pub kinds: Vec<BenchKind>,
    #[serde(default = "default_cache")]
    pub cache: Vec<CacheState>,
    #[serde(default)]
    pub threads: Vec<u32>,
    #[serde(default)]
    pub cardinalities: Vec<u64>,
}

impl Default for Axes {
    fn default() -> Self {
        Axes {
            kinds: default_kinds(),
            cache: default_cache(),
            threads: Vec::new(),
            cardinalities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileSettings {
    #[serde(default = "default_nsys_bin")]
    pub nsys_bin: PathBuf,
    #[serde(default)]
    pub gpu_metrics_device: u32,
    #[serde(default = "default_profile_min_samples")]
    pub min_samples: u32,
    #[serde(default = "default_profile_compression")]
    pub compression: String,
}

fn default_kinds() -> Vec<BenchKind> {
    vec![BenchKind::Parquet, BenchKind::Orc, BenchKind::Json, BenchKind::Csv]
}

fn default_cache() -> Vec<CacheState> {
    vec![CacheState::Hot, CacheState::Cold]
}

fn default_min_samples() -> u32 {
    40
}

fn default_nsys_bin() -> PathBuf {
    PathBuf::from("nsys")
}

fn default_profile_min_samples() -> u32 {
    20
}

fn default_profile_compression() -> String {
    "SNAPPY".to_string()
}

/// The profiling sweep always drives the parquet io-compression reader.
const PROFILE_KIND: BenchKind = BenchKind::Parquet;

pub fn load_plan(path: &Path) -> Result<SweepPlan> {
    let raw = fs::read_to_string(path).map_err(|e| {
        HarnessError::Config(format!("failed to read plan {}: {}", path.display(), e))
    })?;
    let plan: SweepPlan = serde_yaml::from_str(&raw).map_err(|e| {
        HarnessError::Config(format!("invalid plan {}: {}", path.display(), e))
    })?;
    Ok(plan)
}

pub fn validate_plan(plan: &SweepPlan) -> Result<()> {
    let mut missing = Vec::new();
    if plan.version.trim().is_empty() {
        missing.push("/version");
    }
    if plan.sweep.id.trim().is_empty() {
        missing.push("/sweep/id");
    }
    if plan.harness.bench_dir.as_os_str().is_empty() {
        missing.push("/harness/bench_dir");
    }
    if plan.harness.output_dir.as_os_str().is_empty() {
        missing.push("/harness/output_dir");
    }
    if plan.axes.kinds.is_empty() {
        missing.push("/axes/kinds");
    }
    if plan.axes.cache.is_empty() {
        missing.push("/axes/cache");
    }
    if !missing.is_empty() {
        return Err(HarnessError::Config(format!(
            "missing required plan fields: {}",
            missing.join(", ")
        ))
        .into());
    }
    Ok(())
}

fn check_binaries(plan: &SweepPlan, kinds: &[BenchKind]) -> Result<()> {
    let mut missing: Vec<String> = Vec::new();
    for kind in kinds {
        let path = plan.harness.bench_dir.join(kind.spec().binary);
        if !path.exists() {
            missing.push(path.display().to_string());
        }
    }
    missing.sort();
    missing.dedup();
    if !missing.is_empty() {
        return Err(HarnessError::Config(format!(
            "benchmark binary not found: {} (update harness.bench_dir)",
            missing.join(", ")
        ))
        .into());
    }
    Ok(())
}

pub fn sweep_template(plan: &SweepPlan) -> ConfigSet {
    let mut template = ConfigSet::new();
    for (key, value) in &plan.env {
        template.set_env(key, value);
    }
    if let Some(prefix) = &plan.directives.name_prefix {
        template.set_directive(directive::NAME_PREFIX, prefix);
    }
    if plan.directives.output_csv {
        template.set_directive(directive::OUTPUT_CSV, "true");
    }
    if plan.directives.dry_run {
        template.set_directive(directive::DRY_RUN, "true");
    }
    if let Some(compression) = &plan.directives.compression {
        template.set_directive(directive::COMPRESSION, compression);
    }
    template
}

fn axis_points(axes: &Axes, template: &ConfigSet, kind: BenchKind) -> Vec<(BenchKind, ConfigSet)> {
    let thread_values: Vec<Option<u32>> = if axes.threads.is_empty() {
        vec![None]
    } else {
        axes.threads.iter().copied().map(Some).collect()
    };
    // The cardinality axis collapses to a single unset point for kinds whose
    // reader does not take cardinality, so csv/json never multiply across it.
    let card_values: Vec<Option<u64>> =
        if kind.spec().takes_cardinality && !axes.cardinalities.is_empty() {
            axes.cardinalities.iter().copied().map(Some).collect()
        } else {
            vec![None]
        };

    let mut points = Vec::new();
    for &cache in &axes.cache {
        let with_cache = match cache {
            CacheState::Cold => template.with_env(env_keys::DROP_CACHE, "true"),
            CacheState::Hot => template.without_env(env_keys::DROP_CACHE),
        };
        for threads in &thread_values {
            let with_threads = match threads {
                Some(n) => with_cache.with_env(env_keys::IO_THREADS, &n.to_string()),
                None => with_cache.clone(),
            };
            for card in &card_values {
                let point = match card {
                    Some(c) => with_threads.with_directive(directive::CARDINALITY, &c.to_string()),
                    None => with_threads.clone(),
                };
                points.push((kind, point));
            }
        }
    }
    points
}

pub fn enumerate_points(axes: &Axes, template: &ConfigSet) -> Vec<(BenchKind, ConfigSet)> {
    let mut points = Vec::new();
    for &kind in &axes.kinds {
        points.extend(axis_points(axes, template, kind));
    }
    points
}

pub fn build_command(kind: BenchKind, config: &ConfigSet, harness: &HarnessSettings) -> Vec<String> {
    let spec = kind.spec();
    let mut argv = vec![
        harness.bench_dir.join(spec.binary).display().to_string(),
        "-d".to_string(),
        harness.device.to_string(),
        "-b".to_string(),
        spec.selection.to_string(),
    ];
    if let Some(attr) = spec.compression_attr {
        let compression = config.directive(directive::COMPRESSION).unwrap_or("NONE");
        argv.push("-a".to_string());
        argv.push(format!("{}={}", attr, compression));
    }
    for (key, value) in spec.attrs {
        let value = if *key == "cardinality" {
            config.directive(directive::CARDINALITY).unwrap_or(value)
        } else {
            value
        };
        argv.push("-a".to_string());
        argv.push(format!("{}={}", key, value));
    }
    argv.push("--min-samples".to_string());
    argv.push(harness.min_samples.to_string());
    if let Some(timeout) = harness.timeout_secs {
        argv.push("--timeout".to_string());
        argv.push(timeout.to_string());
    }
    if config.has_directive(directive::OUTPUT_CSV) {
        argv.push("--csv".to_string());
        argv.push("stdout".to_string());
    }
    argv
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub dry_run: bool,
}

pub fn prepare_invocation(
    kind: BenchKind,
    config: &ConfigSet,
    harness: &HarnessSettings,
) -> Invocation {
    let name = run_name(config, kind);
    let argv = build_command(kind, config, harness);
    let mut env = config.env_map().clone();
    if env.contains_key(env_keys::LOGFILE_PATH) {
        let log_path = harness.output_dir.join(format!("{}.txt", name));
        env.insert(
            env_keys::LOGFILE_PATH.to_string(),
            log_path.display().to_string(),
        );
    }
    Invocation {
        name,
        argv,
        env,
        dry_run: config.has_directive(directive::DRY_RUN),
    }
}

/// Child environment: overlay layered over an explicit base (normally the
/// enclosing process environment). Neither input is modified.
pub fn merged_env(
    base: &BTreeMap<String, String>,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    for (key, value) in overlay {
        env.insert(key.clone(), value.clone());
    }
    env
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointStatus {
    Completed,
    DryRun,
    Failed(String),
    LaunchFailed(String),
    ExportFailed(String),
}

impl PointStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, PointStatus::Completed | PointStatus::DryRun)
    }
}

impl fmt::Display for PointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointStatus::Completed => write!(f, "completed"),
            PointStatus::DryRun => write!(f, "dry run"),
            PointStatus::Failed(detail) => write!(f, "failed ({})", detail),
            PointStatus::LaunchFailed(detail) => write!(f, "launch failed ({})", detail),
            PointStatus::ExportFailed(detail) => write!(f, "export failed ({})", detail),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PointOutcome {
    pub name: String,
    pub kind: BenchKind,
    pub status: PointStatus,
}

#[derive(Debug)]
pub struct SweepReport {
    pub sweep_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub points: Vec<PointOutcome>,
}

impl SweepReport {
    pub fn failures(&self) -> Vec<&PointOutcome> {
        self.points.iter().filter(|p| p.status.is_failure()).collect()
    }

    pub fn ok(&self) -> bool {
        self.failures().is_empty()
    }
}

pub fn execute(
    invocation: &Invocation,
    base_env: &BTreeMap<String, String>,
) -> std::result::Result<PointStatus, HarnessError> {
    info!(run = %invocation.name, command = %shell_join(&invocation.argv), "--> run");
    if invocation.dry_run {
        info!(run = %invocation.name, env = %env_var_list(&invocation.env), "dry run: launch skipped");
        return Ok(PointStatus::DryRun);
    }
    let env = merged_env(base_env, &invocation.env);
    let status = Command::new(&invocation.argv[0])
        .args(&invocation.argv[1..])
        .env_clear()
        .envs(&env)
        .status()
        .map_err(|source| HarnessError::Launch {
            name: invocation.name.clone(),
            source,
        })?;
    if status.success() {
        Ok(PointStatus::Completed)
    } else {
        Err(HarnessError::Exit {
            name: invocation.name.clone(),
            status: describe_exit(status),
        })
    }
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    status
        .code()
        .map(|c| format!("exit code {}", c))
        .unwrap_or_else(|| "signal".to_string())
}

fn run_point(invocation: &Invocation, base_env: &BTreeMap<String, String>) -> Result<PointStatus> {
    match execute(invocation, base_env) {
        Ok(status) => Ok(status),
        Err(err @ HarnessError::Launch { .. }) => {
            warn!(run = %invocation.name, error = %err, "launch failed");
            Ok(PointStatus::LaunchFailed(err.to_string()))
        }
        Err(HarnessError::Exit { status, .. }) => {
            warn!(run = %invocation.name, %status, "benchmark failed");
            Ok(PointStatus::Failed(status))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOptions {
    pub dry_run: bool,
    pub stop_on_failure: bool,
}

pub fn run_sweep(plan: &SweepPlan, opts: &SweepOptions) -> Result<SweepReport> {
    validate_plan(plan)?;
    let mut template = sweep_template(plan);
    if opts.dry_run {
        template.set_directive(directive::DRY_RUN, "true");
    }
    let dry_run = template.has_directive(directive::DRY_RUN);
    if !dry_run {
        check_binaries(plan, &plan.axes.kinds)?;
        fs::create_dir_all(&plan.harness.output_dir)?;
    }
    let base_env: BTreeMap<String, String> = std::env::vars().collect();
    let started_at = Utc::now().to_rfc3339();

    let mut outcomes = Vec::new();
    for (kind, config) in enumerate_points(&plan.axes, &template) {
        let invocation = prepare_invocation(kind, &config, &plan.harness);
        let status = run_point(&invocation, &base_env)?;
        let failed = status.is_failure();
        outcomes.push(PointOutcome {
            name: invocation.name,
            kind,
            status,
        });
        if failed && opts.stop_on_failure {
            warn!("stopping after first failure");
            break;
        }
    }

    Ok(SweepReport {
        sweep_id: plan.sweep.id.clone(),
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        points: outcomes,
    })
}

pub fn build_profile_command(
    profile: &ProfileSettings,
    output_dir: &Path,
    invocation: &Invocation,
) -> Vec<String> {
    let trace_path = output_dir.join(&invocation.name);
    let mut argv = vec![
        profile.nsys_bin.display().to_string(),
        "profile".to_string(),
        "-o".to_string(),
        trace_path.display().to_string(),
        "-t".to_string(),
        "nvtx,cuda,osrt".to_string(),
        "-f".to_string(),
        "true".to_string(),
        "--backtrace=none".to_string(),
        format!("--gpu-metrics-device={}", profile.gpu_metrics_device),
        "--gpuctxsw=true".to_string(),
        "--cuda-memory-usage=true".to_string(),
    ];
    if !invocation.env.is_empty() {
        argv.push("--env-var".to_string());
        argv.push(env_var_list(&invocation.env));
    }
    argv.extend(invocation.argv.iter().cloned());
    argv
}

pub fn build_export_command(profile: &ProfileSettings, output_dir: &Path, name: &str) -> Vec<String> {
    vec![
        profile.nsys_bin.display().to_string(),
        "export".to_string(),
        "--type=sqlite".to_string(),
        "--lazy=false".to_string(),
        "-f".to_string(),
        "true".to_string(),
        "-o".to_string(),
        output_dir.join(format!("{}.sqlite", name)).display().to_string(),
        output_dir.join(format!("{}.nsys-rep", name)).display().to_string(),
    ]
}

fn export_trace(
    profile: &ProfileSettings,
    output_dir: &Path,
    name: &str,
    base_env: &BTreeMap<String, String>,
) -> std::result::Result<(), HarnessError> {
    let argv = build_export_command(profile, output_dir, name);
    info!(run = %name, command = %shell_join(&argv), "--> export");
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .env_clear()
        .envs(base_env)
        .status()
        .map_err(|e| HarnessError::Export {
            name: name.to_string(),
            detail: e.to_string(),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(HarnessError::Export {
            name: name.to_string(),
            detail: describe_exit(status),
        })
    }
}

pub fn run_profile_sweep(plan: &SweepPlan, opts: &SweepOptions) -> Result<SweepReport> {
    validate_plan(plan)?;
    let profile = plan
        .profile
        .as_ref()
        .ok_or_else(|| HarnessError::Config("plan has no profile section".to_string()))?;
    let mut template = sweep_template(plan);
    template.set_directive(directive::COMPRESSION, &profile.compression);
    if opts.dry_run {
        template.set_directive(directive::DRY_RUN, "true");
    }
    let dry_run = template.has_directive(directive::DRY_RUN);

    let mut harness = plan.harness.clone();
    harness.min_samples = profile.min_samples;
    if !dry_run {
        check_binaries(plan, &[PROFILE_KIND])?;
        fs::create_dir_all(&harness.output_dir)?;
    }
    let base_env: BTreeMap<String, String> = std::env::vars().collect();
    let started_at = Utc::now().to_rfc3339();

    let mut outcomes = Vec::new();
    for (kind, config) in axis_points(&plan.axes, &template, PROFILE_KIND) {
        let invocation = prepare_invocation(kind, &config, &harness);
        let wrapped = Invocation {
            name: invocation.name.clone(),
            argv: build_profile_command(profile, &harness.output_dir, &invocation),
            env: invocation.env.clone(),
            dry_run: invocation.dry_run,
        };
        let status = run_point(&wrapped, &base_env)?;
        let status = match status {
            PointStatus::Completed => {
                match export_trace(profile, &harness.output_dir, &wrapped.name, &base_env) {
                    Ok(()) => PointStatus::Completed,
                    Err(err) => {
                        warn!(run = %wrapped.name, error = %err, "export failed");
                        PointStatus::ExportFailed(err.to_string())
                    }
                }
            }
            PointStatus::DryRun => {
                let export = build_export_command(profile, &harness.output_dir, &wrapped.name);
                info!(run = %wrapped.name, command = %shell_join(&export), "dry run: export skipped");
                PointStatus::DryRun
            }
            other => other,
        };
        let failed = status.is_failure();
        outcomes.push(PointOutcome {
            name: wrapped.name,
            kind,
            status,
        });
        if failed && opts.stop_on_failure {
            warn!("stopping after first failure");
            break;
        }
    }

    Ok(SweepReport {
        sweep_id: plan.sweep.id.clone(),
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        points: outcomes,
    })
}

#[derive(Debug, Clone)]
pub struct SweepSummary {
    pub sweep_id: String,
    pub bench_dir: PathBuf,
    pub output_dir: PathBuf,
    pub kinds: Vec<String>,
    pub cache: Vec<String>,
    pub threads: Vec<u32>,
    pub cardinalities: Vec<u64>,
    pub name_prefix: Option<String>,
    pub output_csv: bool,
    pub dry_run: bool,
    pub has_profile: bool,
    pub total_points: usize,
    pub names: Vec<String>,
}

pub fn describe_plan(plan: &SweepPlan) -> SweepSummary {
    let template = sweep_template(plan);
    let points = enumerate_points(&plan.axes, &template);
    let names: Vec<String> = points
        .iter()
        .map(|(kind, config)| run_name(config, *kind))
        .collect();
    SweepSummary {
        sweep_id: plan.sweep.id.clone(),
        bench_dir: plan.harness.bench_dir.clone(),
        output_dir: plan.harness.output_dir.clone(),
        kinds: plan.axes.kinds.iter().map(|k| k.tag().to_string()).collect(),
        cache: plan.axes.cache.iter().map(|c| c.tag().to_string()).collect(),
        threads: plan.axes.threads.clone(),
        cardinalities: plan.axes.cardinalities.clone(),
        name_prefix: plan.directives.name_prefix.clone(),
        output_csv: plan.directives.output_csv,
        dry_run: plan.directives.dry_run,
        has_profile: plan.profile.is_some(),
        total_points: points.len(),
        names,
    }
}

fn env_var_list(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
