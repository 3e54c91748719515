use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

/// Token the readiness probe must print for a remote file to count as
/// present and readable.
pub const READY_TOKEN: &str = "READY";

/// Remote file transport collaborator: existence/size probing and
/// remote-to-local retrieval.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn exists(&self, remote_path: &str) -> Result<bool>;
    async fn size(&self, remote_path: &str) -> Result<u64>;
    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<()>;
}

/// Strip the `file:` scheme prefix from an output reference. Bare paths
/// pass through unchanged.
pub fn strip_file_scheme(uri: &str) -> &str {
    uri.strip_prefix("file:").unwrap_or(uri)
}

/// Production store shelling out to ssh/scp.
pub struct SshRemoteStore {
    pub host: String,
    pub user: String,
}

impl SshRemoteStore {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        SshRemoteStore {
            host: host.into(),
            user: user.into(),
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[async_trait]
impl RemoteStore for SshRemoteStore {
    async fn exists(&self, remote_path: &str) -> Result<bool> {
        let probe = format!("test -r {} && echo {}", remote_path, READY_TOKEN);
        debug!("remote probe: ssh {} '{}'", self.target(), probe);

        let output = Command::new("ssh")
            .arg(self.target())
            .arg(&probe)
            .output()
            .await
            .with_context(|| format!("Failed to execute ssh probe for: {}", remote_path))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().any(|line| line.trim() == READY_TOKEN))
    }

    async fn size(&self, remote_path: &str) -> Result<u64> {
        let query = format!("stat -c %s {}", remote_path);
        let output = Command::new("ssh")
            .arg(self.target())
            .arg(&query)
            .output()
            .await
            .with_context(|| format!("Failed to execute ssh size query for: {}", remote_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("remote size query failed for {}: {}", remote_path, stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<u64>()
            .with_context(|| format!("Unparseable size for {}: {:?}", remote_path, stdout))
    }

    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let source = format!("{}:{}", self.target(), remote_path);
        debug!("fetching {} -> {}", source, local_path.display());

        let output = Command::new("scp")
            .arg(&source)
            .arg(local_path)
            .output()
            .await
            .with_context(|| format!("Failed to execute scp for: {}", remote_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("scp failed for {}: {}", remote_path, stderr);
        }
        Ok(())
    }
}
