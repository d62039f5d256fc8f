use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{config::RdpSettings, platform::Platform};

const LINUX_CLIENT_CANDIDATES: &[&str] = &["xfreerdp3", "xfreerdp", "wlfreerdp"];
const OS_RELEASE_PATH: &str = "/etc/os-release";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistroFamily {
    Debian,
    Fedora,
    Arch,
    Suse,
    Alpine,
}

impl DistroFamily {
    pub fn install_command(self) -> &'static str {
        match self {
            Self::Debian => "apt-get install -y freerdp3-x11 || apt-get install -y freerdp2-x11",
            Self::Fedora => "dnf install -y freerdp",
            Self::Arch => "pacman -S --noconfirm freerdp",
            Self::Suse => "zypper --non-interactive install freerdp",
            Self::Alpine => "apk add --no-cache freerdp",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "debian" | "ubuntu" | "linuxmint" | "pop" | "elementary" | "raspbian" | "kali" => {
                Some(Self::Debian)
            }
            "fedora" | "rhel" | "centos" | "rocky" | "almalinux" | "ol" | "amzn" => {
                Some(Self::Fedora)
            }
            "arch" | "manjaro" | "endeavouros" | "garuda" => Some(Self::Arch),
            "suse" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => {
                Some(Self::Suse)
            }
            "alpine" => Some(Self::Alpine),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReport {
    pub platform: Platform,
    pub installed: bool,
    pub client_path: Option<PathBuf>,
    pub distro: Option<DistroFamily>,
    pub install_command: Option<String>,
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

pub fn parse_os_release(content: &str) -> Option<DistroFamily> {
    let mut id = None;
    let mut id_like = Vec::new();
    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        match key.trim() {
            "ID" => id = Some(unquote(value).to_ascii_lowercase()),
            "ID_LIKE" => {
                id_like = unquote(value)
                    .split_whitespace()
                    .map(str::to_ascii_lowercase)
                    .collect()
            }
            _ => {}
        }
    }
    id.as_deref()
        .and_then(DistroFamily::from_token)
        .or_else(|| id_like.iter().find_map(|t| DistroFamily::from_token(t)))
}

pub fn detect_distro_from(path: &Path) -> Option<DistroFamily> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| parse_os_release(&content))
}

fn find_linux_client_with<F>(settings: &RdpSettings, lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<PathBuf>,
{
    std::iter::once(settings.linux_client.as_str())
        .chain(LINUX_CLIENT_CANDIDATES.iter().copied())
        .find_map(lookup)
}

/// The FreeRDP binary a Linux session will launch: the configured client
/// when it is on `PATH`, otherwise the first known FreeRDP build that is.
pub fn find_linux_client(settings: &RdpSettings) -> Option<PathBuf> {
    find_linux_client_with(settings, |name| which::which(name).ok())
}

pub fn linux_report(client_path: Option<PathBuf>) -> DependencyReport {
    let distro = detect_distro_from(Path::new(OS_RELEASE_PATH));
    DependencyReport {
        platform: Platform::Linux,
        installed: client_path.is_some(),
        install_command: if client_path.is_some() {
            None
        } else {
            distro.map(|d| d.install_command().to_string())
        },
        client_path,
        distro,
    }
}

fn find_macos_app(settings: &RdpSettings) -> Option<PathBuf> {
    let mut roots = vec![PathBuf::from("/Applications")];
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join("Applications"));
    }
    let names = [settings.macos_app.clone(), "Windows App".to_string()];
    roots
        .iter()
        .flat_map(|root| names.iter().map(move |name| root.join(format!("{name}.app"))))
        .find(|path| path.exists())
}

pub fn probe(platform: Platform, settings: &RdpSettings) -> DependencyReport {
    match platform {
        Platform::Linux => linux_report(find_linux_client(settings)),
        Platform::Windows => {
            let client_path = which::which(&settings.windows_client).ok();
            DependencyReport {
                platform,
                installed: client_path.is_some(),
                client_path,
                distro: None,
                install_command: None,
            }
        }
        Platform::MacOs => {
            let client_path = find_macos_app(settings);
            DependencyReport {
                platform,
                installed: client_path.is_some(),
                client_path,
                distro: None,
                install_command: None,
            }
        }
    }
}
