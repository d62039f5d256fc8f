use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static HEX_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b0x([0-9a-f]{1,8})\b").expect("hex code regex"));

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthFailure,
    AccountIssue,
    ConnectFailure,
    DnsFailure,
    LicenseFailure,
    TimeoutFailure,
    SpawnFailure,
    ProcessExitFailure,
}

impl FailureKind {
    pub fn summary(self) -> &'static str {
        match self {
            Self::AuthFailure => "Authentication failed: check the username and password",
            Self::AccountIssue => "The account cannot sign in (locked, disabled or expired)",
            Self::ConnectFailure => "Could not reach the remote desktop server",
            Self::DnsFailure => "The server name could not be resolved",
            Self::LicenseFailure => "The server rejected the session license",
            Self::TimeoutFailure => "Timed out waiting for the remote desktop connection",
            Self::SpawnFailure => "The remote desktop client could not be started",
            Self::ProcessExitFailure => "The remote desktop client exited unexpectedly",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatternGroup {
    pub kind: FailureKind,
    #[serde(default)]
    pub needles: Vec<String>,
    /// Numeric error codes, matched against any `0x...` token in the text.
    #[serde(default)]
    pub codes: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatternTable {
    #[serde(default = "default_failure_groups")]
    pub failures: Vec<PatternGroup>,
    #[serde(default = "default_success_needles")]
    pub success: Vec<String>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self {
            failures: default_failure_groups(),
            success: default_success_needles(),
        }
    }
}

fn group(kind: FailureKind, needles: &[&str], codes: &[u32]) -> PatternGroup {
    PatternGroup {
        kind,
        needles: needles.iter().map(|n| n.to_string()).collect(),
        codes: codes.to_vec(),
    }
}

fn default_failure_groups() -> Vec<PatternGroup> {
    vec![
        group(
            FailureKind::AuthFailure,
            &[
                "ERRCONNECT_AUTHENTICATION_FAILED",
                "ERRCONNECT_LOGON_FAILURE",
                "STATUS_LOGON_FAILURE",
                "SEC_E_LOGON_DENIED",
                "authentication failure",
                "wrong password",
                "logon failed",
            ],
            &[0x0002_0009, 0x0002_0014, 0xC000_006D],
        ),
        group(
            FailureKind::AccountIssue,
            &[
                "ERRCONNECT_PASSWORD_EXPIRED",
                "ERRCONNECT_PASSWORD_CERTAINLY_EXPIRED",
                "ERRCONNECT_PASSWORD_MUST_CHANGE",
                "ERRCONNECT_ACCOUNT_DISABLED",
                "ERRCONNECT_ACCOUNT_EXPIRED",
                "ERRCONNECT_ACCOUNT_LOCKED_OUT",
                "ERRCONNECT_ACCOUNT_RESTRICTION",
                "STATUS_PASSWORD_EXPIRED",
                "STATUS_PASSWORD_MUST_CHANGE",
                "STATUS_ACCOUNT_DISABLED",
                "STATUS_ACCOUNT_LOCKED_OUT",
                "STATUS_ACCOUNT_EXPIRED",
            ],
            &[0x0002_000E, 0x0002_0012, 0x0002_0013, 0x0002_0015, 0x0002_0016],
        ),
        group(
            FailureKind::ConnectFailure,
            &[
                "ERRCONNECT_CONNECT_FAILED",
                "ERRCONNECT_CONNECT_TRANSPORT_FAILED",
                "ERRCONNECT_CONNECT_CANCELLED",
                "ERRCONNECT_TLS_CONNECT_FAILED",
                "connection refused",
                "no route to host",
                "network is unreachable",
                "unable to connect",
            ],
            &[0x0002_0006, 0x0002_000D, 0x0002_0008],
        ),
        group(
            FailureKind::DnsFailure,
            &[
                "ERRCONNECT_DNS_NAME_NOT_FOUND",
                "ERRCONNECT_DNS_ERROR",
                "name or service not known",
                "getaddrinfo",
                "could not resolve",
                "temporary failure in name resolution",
            ],
            &[0x0002_0005, 0x0002_0004],
        ),
        group(
            FailureKind::LicenseFailure,
            &[
                "ERRINFO_LICENSE",
                "ERRCONNECT_LICENSE",
                "license_",
                "no licenses available",
                "licensing protocol",
            ],
            &[],
        ),
    ]
}

fn default_success_needles() -> Vec<String> {
    [
        "gdi_init",
        "xf_gdi",
        "rdpgfx_recv_caps_confirm",
        "Local framebuffer format",
        "xf_Pointer",
        "Loading Dynamic Virtual Channel rdpgfx",
    ]
    .iter()
    .map(|n| n.to_string())
    .collect()
}

#[derive(Clone, Debug)]
pub struct Classifier {
    failures: Vec<(FailureKind, Vec<String>, Vec<u32>)>,
    success: Vec<String>,
}

impl Classifier {
    pub fn new(table: &PatternTable) -> Self {
        let failures = table
            .failures
            .iter()
            .map(|g| {
                let needles = g
                    .needles
                    .iter()
                    .map(|n| n.trim().to_ascii_lowercase())
                    .filter(|n| !n.is_empty())
                    .collect();
                (g.kind, needles, g.codes.clone())
            })
            .collect();
        let success = table
            .success
            .iter()
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self { failures, success }
    }

    /// Maps one diagnostic fragment to a failure category. The first
    /// matching group wins; unmatched text yields `None`.
    pub fn classify_error(&self, text: &str) -> Option<FailureKind> {
        let lowered = text.to_ascii_lowercase();
        let codes = extract_codes(text);
        self.failures
            .iter()
            .find(|(_, needles, group_codes)| {
                needles.iter().any(|n| lowered.contains(n.as_str()))
                    || codes.iter().any(|c| group_codes.contains(c))
            })
            .map(|(kind, _, _)| *kind)
    }

    pub fn is_success(&self, text: &str) -> bool {
        let lowered = text.to_ascii_lowercase();
        self.success.iter().any(|n| lowered.contains(n.as_str()))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&PatternTable::default())
    }
}

fn extract_codes(text: &str) -> Vec<u32> {
    HEX_CODE_RE
        .captures_iter(text)
        .filter_map(|caps| u32::from_str_radix(&caps[1], 16).ok())
        .collect()
}
