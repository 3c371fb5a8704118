use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::{fs, path::Path};
use tracing::warn;

use crate::client::DeviceEndpoint;

pub const DEFAULT_HOME_LOCATION_ID: &str = "9ae235b74cf64a189acaccd033a1f59f";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub smile: SmileConfig,
    /// Optional Postgres sink; CSV output is always written.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    #[serde(default = "default_stretch")]
    pub stretch: DeviceConfig,
    #[serde(default = "default_smile")]
    pub smile: DeviceConfig,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            stretch: default_stretch(),
            smile: default_smile(),
        }
    }
}

fn default_stretch() -> DeviceConfig {
    DeviceConfig {
        host: "192.168.178.17".into(),
        port: default_port(),
        username: "stretch".into(),
        password: String::new(),
        enabled: true,
    }
}

fn default_smile() -> DeviceConfig {
    DeviceConfig {
        host: "192.168.178.35".into(),
        port: default_port(),
        username: "smile".into(),
        password: String::new(),
        enabled: true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(alias = "ip")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// The gateway password is the 8-letter Smile/Stretch ID printed on the device.
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    80
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    pub fn endpoint(&self, name: &str) -> DeviceEndpoint {
        DeviceEndpoint {
            name: name.to_string(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Take a cumulative meter snapshot once per day
    #[serde(default = "default_true")]
    pub collect_meters: bool,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    1
}
fn default_interval_secs() -> u64 {
    60
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            interval_secs: default_interval_secs(),
            collect_meters: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Daily power file, "{date}" is replaced by YYYYMMDD
    #[serde(default = "default_power_pattern")]
    pub power_filename_pattern: String,
    /// Provisional meter file for the running session
    #[serde(default = "default_meter_session_pattern")]
    pub meter_session_pattern: String,
    /// Meter file name after finalization
    #[serde(default = "default_meter_pattern")]
    pub meter_filename_pattern: String,
}

fn default_directory() -> PathBuf {
    PathBuf::from("data")
}
fn default_power_pattern() -> String {
    "power_usage_{date}.csv".into()
}
fn default_meter_session_pattern() -> String {
    "meter_readings_session_{start_date}.csv".into()
}
fn default_meter_pattern() -> String {
    "meter_readings_{start_date}_{end_date}.csv".into()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            power_filename_pattern: default_power_pattern(),
            meter_session_pattern: default_meter_session_pattern(),
            meter_filename_pattern: default_meter_pattern(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmileConfig {
    /// Id of the "Home" location that aggregates the whole-home meters
    #[serde(default = "default_home_location_id")]
    pub home_location_id: String,
}

fn default_home_location_id() -> String {
    DEFAULT_HOME_LOCATION_ID.into()
}

impl Default for SmileConfig {
    fn default() -> Self {
        Self {
            home_location_id: default_home_location_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// A missing file falls back to the built-in defaults.
    /// Afterwards DATABASE_URL, STRETCH_PASSWORD and SMILE_PASSWORD override the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)?;
            Self::from_yaml(&raw)?
        } else {
            warn!(path = %path.display(), "config file not found; using defaults");
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        // An empty document is valid and means "all defaults"
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            match self.database.as_mut() {
                Some(db) => db.url = url,
                None => {
                    self.database = Some(DatabaseConfig {
                        url,
                        max_connections: default_max_connections(),
                    })
                }
            }
        }
        if let Ok(password) = std::env::var("STRETCH_PASSWORD") {
            self.devices.stretch.password = password;
        }
        if let Ok(password) = std::env::var("SMILE_PASSWORD") {
            self.devices.smile.password = password;
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(
            self.collection.retry_attempts >= 1,
            "collection.retry_attempts must be at least 1"
        );
        anyhow::ensure!(
            self.collection.interval_secs >= 1,
            "collection.interval_secs must be at least 1"
        );
        anyhow::ensure!(
            self.devices.stretch.enabled || self.devices.smile.enabled,
            "at least one of devices.stretch / devices.smile must be enabled"
        );
        anyhow::ensure!(
            self.output.power_filename_pattern.contains("{date}"),
            "output.power_filename_pattern must contain {{date}}"
        );
        anyhow::ensure!(
            self.output.meter_session_pattern.contains("{start_date}"),
            "output.meter_session_pattern must contain {{start_date}}"
        );
        anyhow::ensure!(
            self.output.meter_filename_pattern.contains("{start_date}")
                && self.output.meter_filename_pattern.contains("{end_date}"),
            "output.meter_filename_pattern must contain {{start_date}} and {{end_date}}"
        );
        anyhow::ensure!(
            self.output.meter_session_pattern != self.output.meter_filename_pattern,
            "output.meter_session_pattern must differ from output.meter_filename_pattern"
        );
        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$"; any other "$" is kept as-is.
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    use anyhow::Context;

    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{}'", close))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Consumes characters up to and including `end`.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}
