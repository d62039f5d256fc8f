use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::classifier::PatternTable;

const SETTINGS_KEY: &str = "desktopRdp";
const DATA_DIR_ENV: &str = "RDP_SESSION_DATA_DIR";
const APP_DIR_NAME: &str = "rdp-session";

pub const DEFAULT_GRACE_MS: u64 = 5_000;
pub const DEFAULT_DEADLINE_MS: u64 = 20_000;
pub const DEFAULT_OPTIMISTIC_CONNECT_MS: u64 = 2_000;
pub const DEFAULT_MAX_LOG_LINES: usize = 1200;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RdpSettings {
    /// Silence after spawn that is taken as a successful connection.
    /// `None` disables the heuristic and leaves only the deadline.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: Option<u64>,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    #[serde(default = "default_optimistic_connect_ms")]
    pub optimistic_connect_ms: u64,
    #[serde(default = "default_linux_client")]
    pub linux_client: String,
    #[serde(default = "default_windows_client")]
    pub windows_client: String,
    #[serde(default = "default_macos_app")]
    pub macos_app: String,
    #[serde(default = "default_security_mode")]
    pub security_mode: String,
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    #[serde(default)]
    pub patterns: PatternTable,
}

impl Default for RdpSettings {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            deadline_ms: default_deadline_ms(),
            optimistic_connect_ms: default_optimistic_connect_ms(),
            linux_client: default_linux_client(),
            windows_client: default_windows_client(),
            macos_app: default_macos_app(),
            security_mode: default_security_mode(),
            default_width: default_width(),
            default_height: default_height(),
            max_log_lines: default_max_log_lines(),
            patterns: PatternTable::default(),
        }
    }
}

impl RdpSettings {
    pub fn grace(&self) -> Option<Duration> {
        self.grace_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(if self.deadline_ms == 0 {
            DEFAULT_DEADLINE_MS
        } else {
            self.deadline_ms
        })
    }

    pub fn optimistic_connect(&self) -> Duration {
        Duration::from_millis(self.optimistic_connect_ms)
    }

    fn normalized(mut self) -> Self {
        if self.deadline_ms == 0 {
            self.deadline_ms = DEFAULT_DEADLINE_MS;
        }
        if self.linux_client.trim().is_empty() {
            self.linux_client = default_linux_client();
        }
        if self.windows_client.trim().is_empty() {
            self.windows_client = default_windows_client();
        }
        if self.macos_app.trim().is_empty() {
            self.macos_app = default_macos_app();
        }
        if self.default_width == 0 {
            self.default_width = default_width();
        }
        if self.default_height == 0 {
            self.default_height = default_height();
        }
        if self.max_log_lines == 0 {
            self.max_log_lines = DEFAULT_MAX_LOG_LINES;
        }
        self
    }
}

fn default_grace_ms() -> Option<u64> {
    Some(DEFAULT_GRACE_MS)
}

fn default_deadline_ms() -> u64 {
    DEFAULT_DEADLINE_MS
}

fn default_optimistic_connect_ms() -> u64 {
    DEFAULT_OPTIMISTIC_CONNECT_MS
}

fn default_linux_client() -> String {
    "xfreerdp".to_string()
}

fn default_windows_client() -> String {
    "mstsc".to_string()
}

fn default_macos_app() -> String {
    "Microsoft Remote Desktop".to_string()
}

fn default_security_mode() -> String {
    "nla".to_string()
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_max_log_lines() -> usize {
    DEFAULT_MAX_LOG_LINES
}

pub fn settings_file_path() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim()).join("settings.json");
        }
    }
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
        .join("settings.json")
}

fn read_settings_root(path: &Path) -> Value {
    let raw = fs::read_to_string(path).unwrap_or_default();
    let parsed = serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| json!({}));
    if parsed.is_object() {
        parsed
    } else {
        json!({})
    }
}

pub fn load_settings_from_path(path: &Path) -> RdpSettings {
    let root = read_settings_root(path);
    let Some(section) = root.get(SETTINGS_KEY).cloned() else {
        return RdpSettings::default();
    };
    match serde_json::from_value::<RdpSettings>(section) {
        Ok(settings) => settings.normalized(),
        Err(err) => {
            log::warn!(
                "ignoring malformed {SETTINGS_KEY} section in {}: {err}",
                path.display()
            );
            RdpSettings::default()
        }
    }
}

pub fn load_settings() -> RdpSettings {
    load_settings_from_path(&settings_file_path())
}

pub fn save_settings_to_path(path: &Path, settings: &RdpSettings) -> Result<()> {
    let mut root = read_settings_root(path);
    root[SETTINGS_KEY] = serde_json::to_value(settings)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(&root)?)?;
    Ok(())
}

pub fn save_settings(settings: &RdpSettings) -> Result<()> {
    save_settings_to_path(&settings_file_path(), settings)
}
