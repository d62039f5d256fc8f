use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::config::RdpSettings;

pub const DEFAULT_RDP_PORT: u16 = 3389;
const PROFILE_FILE_PREFIX: &str = "rdp-session-";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fullscreen: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl SessionConfig {
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `DOMAIN\user` when a domain is set, the bare username otherwise.
    pub fn qualified_username(&self) -> String {
        match self.domain.as_deref() {
            Some(domain) if !self.username.is_empty() => format!("{domain}\\{}", self.username),
            _ => self.username.clone(),
        }
    }

    pub fn credential_target(&self) -> String {
        format!("TERMSRV/{}", self.host)
    }
}

pub fn normalize_request(
    request: &ConnectionRequest,
    settings: &RdpSettings,
) -> Result<(String, SessionConfig)> {
    let host = request.host.trim().to_string();
    if host.is_empty() {
        return Err(anyhow!("Remote desktop host is required"));
    }
    if host.chars().any(char::is_whitespace) {
        return Err(anyhow!("Remote desktop host must not contain whitespace"));
    }

    let config = SessionConfig {
        port: if request.port == 0 {
            DEFAULT_RDP_PORT
        } else {
            request.port
        },
        username: request.username.trim().to_string(),
        password: request.password.clone(),
        domain: request
            .domain
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
        width: request
            .width
            .filter(|w| *w > 0)
            .unwrap_or(settings.default_width),
        height: request
            .height
            .filter(|h| *h > 0)
            .unwrap_or(settings.default_height),
        fullscreen: request.fullscreen,
        host,
    };

    let id = request
        .id
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| derive_session_id(&config));

    Ok((id, config))
}

pub fn derive_session_id(config: &SessionConfig) -> String {
    if config.username.is_empty() {
        format!("rdp:{}:{}", config.host, config.port)
    } else {
        format!("rdp:{}@{}:{}", config.username, config.host, config.port)
    }
}

/// Profile values are single-line; strip anything that could start a new key.
fn profile_value(raw: &str) -> String {
    raw.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

pub fn render_profile(config: &SessionConfig) -> String {
    let mut lines = vec![
        format!("full address:s:{}", profile_value(&config.address())),
        format!("username:s:{}", profile_value(&config.qualified_username())),
    ];
    if let Some(domain) = config.domain.as_deref() {
        lines.push(format!("domain:s:{}", profile_value(domain)));
    }
    lines.extend([
        format!(
            "screen mode id:i:{}",
            if config.fullscreen { 2 } else { 1 }
        ),
        format!("desktopwidth:i:{}", config.width),
        format!("desktopheight:i:{}", config.height),
        "session bpp:i:32".to_string(),
        "compression:i:1".to_string(),
        "redirectclipboard:i:1".to_string(),
        "authentication level:i:2".to_string(),
        "negotiate security layer:i:1".to_string(),
        "enablecredsspsupport:i:1".to_string(),
        "prompt for credentials:i:0".to_string(),
        "autoreconnection enabled:i:1".to_string(),
        "bitmapcachepersistenable:i:1".to_string(),
    ]);
    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}

fn sanitize_file_component(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn profile_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!(
        "{PROFILE_FILE_PREFIX}{}.rdp",
        sanitize_file_component(id)
    ))
}

pub fn write_profile(dir: &Path, id: &str, config: &SessionConfig) -> Result<PathBuf> {
    let path = profile_path(dir, id);
    fs::write(&path, render_profile(config))
        .with_context(|| format!("failed to write RDP profile {}", path.display()))?;
    Ok(path)
}

pub fn freerdp_args(id: &str, config: &SessionConfig, settings: &RdpSettings) -> Vec<String> {
    let mut args = vec![format!("/v:{}", config.address())];
    if !config.username.is_empty() {
        args.push(format!("/u:{}", config.username));
    }
    if !config.password.is_empty() {
        args.push(format!("/p:{}", config.password));
    }
    if let Some(domain) = config.domain.as_deref() {
        args.push(format!("/d:{domain}"));
    }
    args.push(format!("/title:{}", window_title(id, config)));
    args.push("/cert:ignore".to_string());
    let security = settings.security_mode.trim();
    if !security.is_empty() {
        args.push(format!("/sec:{security}"));
    }
    args.push("+clipboard".to_string());
    args.push("/gfx".to_string());
    args.push("/bpp:32".to_string());
    args.push("+auto-reconnect".to_string());
    if config.fullscreen {
        args.push("/f".to_string());
    } else {
        args.push(format!("/size:{}x{}", config.width, config.height));
        args.push("/dynamic-resolution".to_string());
    }
    args.push("/log-level:INFO".to_string());
    args
}

fn window_title(id: &str, config: &SessionConfig) -> String {
    if id.starts_with("rdp:") {
        if config.username.is_empty() {
            config.host.clone()
        } else {
            format!("{}@{}", config.username, config.host)
        }
    } else {
        id.to_string()
    }
}
