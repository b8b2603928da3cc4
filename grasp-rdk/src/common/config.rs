use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_AUXILIARY_CONFIG_DIR: &str = "cfg";
pub const DEFAULT_SNAPSHOT_FILE_NAME: &str = "visualization.png";

pub const DEFAULT_ROTATION_RESOLUTION: u32 = 24;
pub const DEFAULT_TOP_N: u32 = 3;
pub const DEFAULT_N_BEST: u32 = 1;

/// Format a given detector build uses to report its results on stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputDialect {
    /// A single JSON document with `tf_matrices`, `widths` and `scores`.
    #[default]
    Structured,
    /// Human readable progress log, only scores are real.
    TextualLog,
}

#[derive(Error, Debug)]
#[error("unknown output dialect {0:?}, expected `structured` or `textual-log`")]
pub struct UnknownDialect(String);

impl FromStr for OutputDialect {
    type Err = UnknownDialect;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" | "json" => Ok(OutputDialect::Structured),
            "textual-log" | "textual" | "log" => Ok(OutputDialect::TextualLog),
            _ => Err(UnknownDialect(s.to_owned())),
        }
    }
}

impl fmt::Display for OutputDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputDialect::Structured => write!(f, "structured"),
            OutputDialect::TextualLog => write!(f, "textual-log"),
        }
    }
}

/// Process wide service configuration. Built once at start-up and shared
/// read-only with every component.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    executable_path: PathBuf,
    primary_config_path: PathBuf,
    auxiliary_config_paths: Vec<PathBuf>,
    auxiliary_config_dir: PathBuf,
    workspace_dir: PathBuf,
    timeout: Duration,
    dialect: OutputDialect,
    snapshot_file_name: String,
}

impl ServiceConfig {
    pub fn new(executable_path: impl Into<PathBuf>, primary_config_path: impl Into<PathBuf>) -> Self {
        Self {
            executable_path: executable_path.into(),
            primary_config_path: primary_config_path.into(),
            auxiliary_config_paths: vec![],
            auxiliary_config_dir: PathBuf::from(DEFAULT_AUXILIARY_CONFIG_DIR),
            workspace_dir: std::env::temp_dir().join("grasp-rdk"),
            timeout: DEFAULT_TIMEOUT,
            dialect: OutputDialect::default(),
            snapshot_file_name: DEFAULT_SNAPSHOT_FILE_NAME.to_owned(),
        }
    }

    pub fn with_auxiliary_configs(mut self, paths: Vec<PathBuf>) -> Self {
        self.auxiliary_config_paths = paths;
        self
    }

    pub fn with_auxiliary_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.auxiliary_config_dir = dir.into();
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dialect(mut self, dialect: OutputDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_snapshot_file_name(mut self, name: impl Into<String>) -> Self {
        self.snapshot_file_name = name.into();
        self
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    pub fn primary_config_path(&self) -> &Path {
        &self.primary_config_path
    }

    pub fn auxiliary_config_paths(&self) -> &[PathBuf] {
        &self.auxiliary_config_paths
    }

    /// Directory the detector reads its auxiliary configs from, resolved
    /// against the executable's own directory when relative.
    pub fn auxiliary_config_dir(&self) -> PathBuf {
        if self.auxiliary_config_dir.is_absolute() {
            self.auxiliary_config_dir.clone()
        } else {
            self.executable_dir().join(&self.auxiliary_config_dir)
        }
    }

    /// The detector runs with this as its working directory.
    pub fn executable_dir(&self) -> PathBuf {
        match self.executable_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn dialect(&self) -> OutputDialect {
        self.dialect
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.workspace_dir.join(&self.snapshot_file_name)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ParamError {
    #[error("parameter {name} must be a positive integer, got {value:?}")]
    NotPositiveInteger { name: &'static str, value: String },
    #[error("parameter {name} must be a boolean, got {value:?}")]
    NotBoolean { name: &'static str, value: String },
}

/// Tuning parameters forwarded to the detector for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectionParams {
    pub rotation_resolution: u32,
    pub top_n: u32,
    pub n_best: u32,
    pub visualization_enabled: bool,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            rotation_resolution: DEFAULT_ROTATION_RESOLUTION,
            top_n: DEFAULT_TOP_N,
            n_best: DEFAULT_N_BEST,
            visualization_enabled: false,
        }
    }
}

impl DetectionParams {
    /// Reads the form fields of a detection request, applying defaults for
    /// missing ones.
    pub fn from_form(fields: &HashMap<String, String>) -> Result<Self, ParamError> {
        let defaults = Self::default();
        Ok(Self {
            rotation_resolution: positive(
                fields,
                "rotation_resolution",
                defaults.rotation_resolution,
            )?,
            top_n: positive(fields, "top_n", defaults.top_n)?,
            n_best: positive(fields, "n_best", defaults.n_best)?,
            visualization_enabled: boolean(
                fields,
                "enable_visualization",
                defaults.visualization_enabled,
            )?,
        })
    }

    /// Form encoding understood by [`DetectionParams::from_form`].
    pub fn to_form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("rotation_resolution", self.rotation_resolution.to_string()),
            ("top_n", self.top_n.to_string()),
            ("n_best", self.n_best.to_string()),
            ("enable_visualization", self.visualization_enabled.to_string()),
        ]
    }
}

fn positive(
    fields: &HashMap<String, String>,
    name: &'static str,
    default: u32,
) -> Result<u32, ParamError> {
    let Some(raw) = fields.get(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ParamError::NotPositiveInteger {
            name,
            value: raw.clone(),
        }),
    }
}

fn boolean(
    fields: &HashMap<String, String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ParamError> {
    let Some(raw) = fields.get(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ParamError::NotBoolean {
            name,
            value: raw.clone(),
        }),
    }
}
