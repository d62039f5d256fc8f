use anyhow::{anyhow, Context, Result};
use std::process::Command;

pub trait CredentialStore: Send + Sync {
    fn store(&self, target: &str, username: &str, password: &str) -> Result<()>;
    fn remove(&self, target: &str) -> Result<()>;
}

/// Writes generic credentials through `cmdkey`, which mstsc consults for
/// `TERMSRV/<host>` targets.
#[derive(Default)]
pub struct CmdkeyCredentialStore;

impl CmdkeyCredentialStore {
    fn run(args: &[String]) -> Result<()> {
        let output = Command::new("cmdkey")
            .args(args)
            .output()
            .context("failed to execute cmdkey")?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Err(anyhow!(
            "cmdkey exited with {}: {}",
            output.status,
            if stderr.is_empty() { stdout } else { stderr }
        ))
    }
}

impl CredentialStore for CmdkeyCredentialStore {
    fn store(&self, target: &str, username: &str, password: &str) -> Result<()> {
        Self::run(&cmdkey_store_args(target, username, password))
    }

    fn remove(&self, target: &str) -> Result<()> {
        Self::run(&[format!("/delete:{target}")])
    }
}

fn cmdkey_store_args(target: &str, username: &str, password: &str) -> Vec<String> {
    vec![
        format!("/generic:{target}"),
        format!("/user:{username}"),
        format!("/pass:{password}"),
    ]
}

#[derive(Default)]
pub struct NoopCredentialStore;

impl CredentialStore for NoopCredentialStore {
    fn store(&self, _target: &str, _username: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _target: &str) -> Result<()> {
        Ok(())
    }
}
