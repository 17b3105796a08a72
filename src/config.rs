//! Config module.
//! Resolves the effective configuration from three sources, field by field:
//! command-line overrides win, then the YAML settings file, then defaults
//! (or a value derived from another field).
//! Everything is validated here so that no partial config reaches the sensor.

use crate::pattern::{DataPattern, LogEntryPattern};
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SETTINGS_FILE: &str = "default_config.yaml";
/// Marker searched for in the device path to derive the output suffix.
pub const BUS_TOKEN: &str = "i2c";
pub const DATA_LOG_BASENAME: &str = "mag_log";
pub const ERROR_LOG_BASENAME: &str = "error-log";
const LOG_EXTENSION: &str = ".txt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "settings file '{}' not found (pass --file <path>, or create {} in the working directory)",
        .path.display(),
        DEFAULT_SETTINGS_FILE
    )]
    FileNotFound { path: PathBuf },
    #[error("cannot read settings file '{}'", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file '{}' is not valid YAML", .path.display())]
    Syntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for '{key}': {reason}")]
    MalformedValue { key: String, reason: String },
    #[error("no {field} given (use --device or set '{key}' in the settings file)")]
    MissingRequired {
        field: &'static str,
        key: &'static str,
    },
}

/// Values given on the command line. `None`/`false` means "not given".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub device: Option<String>,
    pub settings_file: Option<PathBuf>,
    pub outsuffix: Option<String>,
    pub output_dir: Option<String>,
    pub verbose: bool,
    pub calibration: bool,
}

impl CliOverrides {
    pub fn settings_path<'a>(&'a self, defaults: &'a Defaults) -> &'a Path {
        self.settings_file
            .as_deref()
            .unwrap_or(defaults.settings_file.as_path())
    }
}

/// Recognized keys of the settings file. Absent (or null) keys are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub device: Option<String>,
    pub outsuffix: Option<String>,
    pub output_dir: Option<String>,
    pub calibration: Option<bool>,
    pub pattern: Option<String>,
    pub data_pattern: Option<String>,
}

impl FileConfig {
    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let document: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Syntax {
            path: path.to_path_buf(),
            source,
        })?;
        let map = match document {
            Value::Mapping(map) => map,
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(ConfigError::MalformedValue {
                    key: "<document>".to_string(),
                    reason: format!("expected a mapping of settings, found {}", kind(&other)),
                });
            }
        };

        Ok(Self {
            device: text_field(&map, "device")?,
            outsuffix: text_field(&map, "outsuffix")?,
            output_dir: text_field(&map, "output_dir")?,
            calibration: field(&map, "calibration")?,
            pattern: text_field(&map, "pattern")?,
            data_pattern: text_field(&map, "data_pattern")?,
        })
    }
}

fn field<T: DeserializeOwned>(map: &Mapping, key: &str) -> Result<Option<T>, ConfigError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|e| ConfigError::MalformedValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Text settings take any scalar as written (`outsuffix: 2` is the text "2").
fn text_field(map: &Mapping, key: &str) -> Result<Option<String>, ConfigError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(other) => Err(ConfigError::MalformedValue {
            key: key.to_string(),
            reason: format!("expected text, found {}", kind(other)),
        }),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Reads and parses the settings file.
pub fn load_settings(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        },
    })?;
    FileConfig::from_yaml_str(&text, path)
}

/// Static fallbacks.
#[derive(Clone, Debug)]
pub struct Defaults {
    pub settings_file: PathBuf,
    pub bus_token: String,
    pub data_pattern: DataPattern,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            settings_file: PathBuf::from(DEFAULT_SETTINGS_FILE),
            bus_token: BUS_TOKEN.to_string(),
            data_pattern: DataPattern::default(),
        }
    }
}

/// Fully resolved settings. Built once, never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub device_path: String,
    pub output_suffix: String,
    pub output_dir: String,
    pub run_calibration: bool,
    pub verbose: bool,
    pub data_pattern: DataPattern,
    pub log_entry_pattern: Option<LogEntryPattern>,
}

impl EffectiveConfig {
    pub fn data_log_path(&self) -> PathBuf {
        self.log_path(DATA_LOG_BASENAME)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.log_path(ERROR_LOG_BASENAME)
    }

    fn log_path(&self, basename: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}{}{}{}",
            self.output_dir, basename, self.output_suffix, LOG_EXTENSION
        ))
    }
}

/// First present value wins.
fn first_of<T>(candidates: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    candidates.into_iter().flatten().next()
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// `_` + the device path from the first bus token onward, or empty.
pub fn derive_suffix(device_path: &str, bus_token: &str) -> String {
    if bus_token.is_empty() {
        return String::new();
    }
    device_path
        .find(bus_token)
        .map(|at| format!("_{}", &device_path[at..]))
        .unwrap_or_default()
}

/// Forward slashes only, and exactly one trailing separator when non-empty.
pub fn normalize_output_dir(dir: &str) -> String {
    let dir = dir.replace('\\', "/");
    if dir.is_empty() {
        return dir;
    }
    format!("{}/", dir.trim_end_matches('/'))
}

pub fn resolve(
    cli: &CliOverrides,
    file: &FileConfig,
    defaults: &Defaults,
) -> Result<EffectiveConfig, ConfigError> {
    let device_path = first_of([non_empty(cli.device.as_ref()), non_empty(file.device.as_ref())])
        .ok_or(ConfigError::MissingRequired {
            field: "device path",
            key: "device",
        })?;

    let output_suffix = first_of([cli.outsuffix.clone(), file.outsuffix.clone()])
        .unwrap_or_else(|| derive_suffix(&device_path, &defaults.bus_token));

    let output_dir = first_of([cli.output_dir.clone(), file.output_dir.clone()])
        .map(|dir| normalize_output_dir(&dir))
        .unwrap_or_default();

    let run_calibration = first_of([cli.calibration.then_some(true), file.calibration])
        .unwrap_or(false);

    let data_pattern = match &file.data_pattern {
        Some(source) => DataPattern::parse(source).map_err(|e| ConfigError::MalformedValue {
            key: "data_pattern".to_string(),
            reason: e.to_string(),
        })?,
        None => defaults.data_pattern.clone(),
    };

    Ok(EffectiveConfig {
        device_path,
        output_suffix,
        output_dir,
        run_calibration,
        verbose: cli.verbose,
        data_pattern,
        log_entry_pattern: file.pattern.as_deref().map(LogEntryPattern::parse),
    })
}
