use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Environment variables the benchmark binaries consult. These names are part
/// of the binaries' contract and are forwarded verbatim to the child process.
pub mod env_keys {
    /// Present (any value) means the benchmark drops the OS page cache before
    /// each measurement, i.e. a cold-cache run.
    pub const DROP_CACHE: &str = "CUDF_BENCHMARK_DROP_CACHE";
    pub const IO_THREADS: &str = "KVIKIO_NTHREADS";
    pub const COMPAT_MODE: &str = "KVIKIO_COMPAT_MODE";
    pub const IO_POLICY: &str = "LIBCUDF_CUFILE_POLICY";
    pub const TMPDIR: &str = "TMPDIR";
    /// Filename-bearing: the executor rewrites this to point at the run's own
    /// log file before launch.
    pub const LOGFILE_PATH: &str = "CUFILE_LOGFILE_PATH";
}

/// Harness-internal keys. Consumed by naming and command construction only;
/// never forwarded to the child environment.
pub mod directive {
    pub const NAME_PREFIX: &str = "name_prefix";
    pub const OUTPUT_CSV: &str = "output_csv";
    pub const DRY_RUN: &str = "dry_run";
    pub const CARDINALITY: &str = "cardinality";
    pub const COMPRESSION: &str = "compression";
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to launch {name}: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} failed with {status}")]
    Exit { name: String, status: String },
    #[error("profile export failed for {name}: {detail}")]
    Export { name: String, detail: String },
}

/// One sweep point's configuration. Environment keys and directive keys live
/// in separate maps so a directive can never leak into a child process by
/// accident. All `with_`/`without_` methods return a new independent set and
/// leave the receiver untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSet {
    env: BTreeMap<String, String>,
    directives: BTreeMap<String, String>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn set_directive(&mut self, key: &str, value: &str) {
        self.directives.insert(key.to_string(), value.to_string());
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn has_env(&self, key: &str) -> bool {
        self.env.contains_key(key)
    }

    pub fn directive(&self, key: &str) -> Option<&str> {
        self.directives.get(key).map(String::as_str)
    }

    pub fn has_directive(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    pub fn env_map(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn with_env(&self, key: &str, value: &str) -> ConfigSet {
        let mut next = self.clone();
        next.set_env(key, value);
        next
    }

    pub fn without_env(&self, key: &str) -> ConfigSet {
        let mut next = self.clone();
        next.env.remove(key);
        next
    }

    pub fn with_directive(&self, key: &str, value: &str) -> ConfigSet {
        let mut next = self.clone();
        next.set_directive(key, value);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Hot,
    Cold,
}

impl CacheState {
    pub fn tag(self) -> &'static str {
        match self {
            CacheState::Hot => "hot",
            CacheState::Cold => "cold",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BenchKind {
    Parquet,
    ParquetSmallMixed,
    Orc,
    Json,
    Csv,
}

/// Per-kind command fragment: binary name, benchmark-selection option and the
/// fixed attribute flags the reader takes. `compression_attr` is the name of
/// the compression attribute for kinds that have one; json/csv never emit
/// compression flags.
#[derive(Debug, Clone, Copy)]
pub struct KindSpec {
    pub binary: &'static str,
    pub selection: &'static str,
    pub attrs: &'static [(&'static str, &'static str)],
    pub compression_attr: Option<&'static str>,
    pub takes_cardinality: bool,
}

const PARQUET_SPEC: KindSpec = KindSpec {
    binary: "PARQUET_READER_NVBENCH",
    selection: "parquet_read_io_compression",
    attrs: &[
        ("io_type", "FILEPATH"),
        ("cardinality", "0"),
        ("run_length", "1"),
    ],
    compression_attr: Some("compression_type"),
    takes_cardinality: true,
};

const PARQUET_SMALL_MIXED_SPEC: KindSpec = KindSpec {
    binary: "PARQUET_READER_NVBENCH",
    selection: "parquet_read_io_small_mixed",
    attrs: &[
        ("io_type", "FILEPATH"),
        ("num_string_cols", "3"),
        ("cardinality", "0"),
        ("run_length", "1"),
    ],
    compression_attr: None,
    takes_cardinality: true,
};

const ORC_SPEC: KindSpec = KindSpec {
    binary: "ORC_READER_NVBENCH",
    selection: "orc_read_io_compression",
    attrs: &[
        ("io", "FILEPATH"),
        ("cardinality", "0"),
        ("run_length", "1"),
    ],
    compression_attr: Some("compression"),
    takes_cardinality: true,
};

const JSON_SPEC: KindSpec = KindSpec {
    binary: "JSON_READER_NVBENCH",
    selection: "json_read_io",
    attrs: &[("io", "FILEPATH")],
    compression_attr: None,
    takes_cardinality: false,
};

const CSV_SPEC: KindSpec = KindSpec {
    binary: "CSV_READER_NVBENCH",
    selection: "csv_read_io",
    attrs: &[("io", "FILEPATH")],
    compression_attr: None,
    takes_cardinality: false,
};

impl BenchKind {
    pub const ALL: [BenchKind; 5] = [
        BenchKind::Parquet,
        BenchKind::ParquetSmallMixed,
        BenchKind::Orc,
        BenchKind::Json,
        BenchKind::Csv,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            BenchKind::Parquet => "parquet",
            BenchKind::ParquetSmallMixed => "parquet_small_mixed",
            BenchKind::Orc => "orc",
            BenchKind::Json => "json",
            BenchKind::Csv => "csv",
        }
    }

    pub fn spec(self) -> &'static KindSpec {
        match self {
            BenchKind::Parquet => &PARQUET_SPEC,
            BenchKind::ParquetSmallMixed => &PARQUET_SMALL_MIXED_SPEC,
            BenchKind::Orc => &ORC_SPEC,
            BenchKind::Json => &JSON_SPEC,
            BenchKind::Csv => &CSV_SPEC,
        }
    }
}

impl fmt::Display for BenchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Builds the run name that identifies one sweep point's output artifacts.
///
/// Component order is fixed and doubles as the on-disk naming contract, so
/// changing it invalidates existing result archives:
///   1. name prefix directive, when present
///   2. benchmark-kind tag
///   3. `cold` when the cache-drop env key is present, `hot` otherwise
///   4. `threads<N>` when the I/O thread-count env key is present
///   5. `card<N>` when the cardinality directive is present
/// Components are joined with `_`; empty components are skipped so the name
/// never starts with or doubles the separator. The `threads`/`card` labels
/// keep distinct axes from colliding on equal numeric values.
pub fn run_name(config: &ConfigSet, kind: BenchKind) -> String {
    let mut name = String::new();
    if let Some(prefix) = config.directive(directive::NAME_PREFIX) {
        push_component(&mut name, prefix);
    }
    push_component(&mut name, kind.tag());
    let cache = if config.has_env(env_keys::DROP_CACHE) {
        CacheState::Cold
    } else {
        CacheState::Hot
    };
    push_component(&mut name, cache.tag());
    if let Some(threads) = config.env_var(env_keys::IO_THREADS) {
        push_component(&mut name, &format!("threads{}", threads));
    }
    if let Some(card) = config.directive(directive::CARDINALITY) {
        push_component(&mut name, &format!("card{}", card));
    }
    name
}

fn push_component(name: &mut String, component: &str) {
    if component.is_empty() {
        return;
    }
    if !name.is_empty() {
        name.push('_');
    }
    name.push_str(component);
}
