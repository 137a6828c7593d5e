//! Configuration knobs enumerated in the external interface (database path, read-only,
//! engine passthrough config, replacement scan toggle, default statistics, output format,
//! and connection init SQL), plus the `STATISTICS_ENABLED` environment override.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{Error, Result, Status};

/// Arrow output selector for [`crate::connection::ConnectionCore::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    ArrowTable,
    ArrowStream,
    ArrowCapsule,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::ArrowStream
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arrow_table" => Ok(OutputFormat::ArrowTable),
            "arrow_stream" => Ok(OutputFormat::ArrowStream),
            "arrow_capsule" => Ok(OutputFormat::ArrowCapsule),
            other => Err(Error::new(
                format!("unrecognized output_format: {other}"),
                Status::InvalidOutputType,
            )),
        }
    }
}

/// `statistics=` / `default_statistics=` specification from spec.md §4.4.
#[derive(Debug, Clone)]
pub enum StatisticsSpec {
    Disabled,
    All,
    Numeric,
    Pattern(String),
    Columns(Vec<String>),
}

impl StatisticsSpec {
    /// Resolve against a schema's column names, per §4.4's "Rules".
    ///
    /// `is_numeric` classifies a column as numeric-like (int/float/date/timestamp) by name.
    pub fn resolve(
        &self,
        column_names: &[String],
        is_numeric: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        match self {
            StatisticsSpec::Disabled => Ok(Vec::new()),
            StatisticsSpec::All => Ok(column_names.to_vec()),
            StatisticsSpec::Numeric => {
                Ok(column_names.iter().filter(|c| is_numeric(c)).cloned().collect())
            }
            StatisticsSpec::Pattern(pattern) => {
                let re = Regex::new(pattern)?;
                Ok(column_names
                    .iter()
                    .filter(|c| re.is_match(c))
                    .cloned()
                    .collect())
            }
            StatisticsSpec::Columns(names) => {
                for name in names {
                    if !column_names.iter().any(|c| c == name) {
                        return Err(Error::new(
                            format!("unknown column in statistics spec: {name}"),
                            Status::InvalidArguments,
                        ));
                    }
                }
                Ok(names.clone())
            }
        }
    }
}

/// Connection-scoped configuration (spec.md §6, "Configuration knobs").
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the on-disk database, or `None` for in-memory.
    pub database: Option<String>,
    /// Open without write capability. Incompatible with an in-memory database.
    pub read_only: bool,
    /// Forwarded verbatim to the engine (threads, memory_limit, ...).
    pub engine_config: HashMap<String, String>,
    /// Turn on lexical-scope name resolution (replacement scan).
    pub enable_replacement_scan: bool,
    /// Default `statistics` spec used by `register` when the caller omits one.
    pub default_statistics: StatisticsSpec,
    /// Default output format for `execute`.
    pub output_format: OutputFormat,
    /// SQL run on every new connection.
    pub init_sql: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: None,
            read_only: false,
            engine_config: HashMap::new(),
            enable_replacement_scan: true,
            default_statistics: StatisticsSpec::Disabled,
            output_format: OutputFormat::default(),
            init_sql: default_init_sql(),
        }
    }
}

/// The init SQL applied on every new connection: Arrow output options and
/// insertion-order preservation, as named in spec.md §6.
fn default_init_sql() -> Vec<String> {
    vec![
        "SET arrow_output_version='1.5'".to_string(),
        "SET arrow_output_list_view=true".to_string(),
        "SET preserve_insertion_order=true".to_string(),
    ]
}

impl Config {
    /// Validate the read-only/in-memory conflict (spec.md §4.7).
    pub fn validate(&self) -> Result<()> {
        if self.read_only && self.database.is_none() {
            return Err(Error::new(
                "cannot open an in-memory database read-only",
                Status::ReadOnlyMemoryNotAllowed,
            ));
        }
        Ok(())
    }

    /// Whether the `STATISTICS_ENABLED` environment variable disables the extractor
    /// globally, overriding any per-registration `statistics` request (spec.md §6).
    pub fn statistics_globally_enabled() -> bool {
        match std::env::var("STATISTICS_ENABLED") {
            Ok(value) => !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off" | ""
            ),
            Err(_) => true,
        }
    }
}
