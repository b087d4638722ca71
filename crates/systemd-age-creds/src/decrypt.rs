//! Decryption through the `age` command-line tool.
//!
//! The daemon never implements cryptography itself. Each request runs
//!
//! ```text
//! <age_bin> --decrypt --identity <identity> <dir>/<credential>.age
//! ```
//!
//! and takes the tool's stdout as the plaintext. The subprocess is killed if
//! the request deadline passes first.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::time::Instant;

use age_creds_core::config::credential_path;
use age_creds_core::{Config, DecryptError, Decryptor};
use tokio::process::Command;
use tracing::debug;
use zeroize::Zeroizing;

/// Longest stderr excerpt kept in a [`DecryptError::Failed`] diagnostic.
const MAX_DIAGNOSTIC_LEN: usize = 512;

/// [`Decryptor`] backed by the `age` binary.
#[derive(Debug, Clone)]
pub struct AgeDecryptor {
    age_bin: PathBuf,
    identity: PathBuf,
    dir: PathBuf,
}

impl AgeDecryptor {
    pub fn new(
        age_bin: impl Into<PathBuf>,
        identity: impl Into<PathBuf>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            age_bin: age_bin.into(),
            identity: identity.into(),
            dir: dir.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.age_bin, &config.identity, &config.dir)
    }

    async fn run(
        &self,
        credential_id: &str,
        deadline: Option<Instant>,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
        let path = credential_path(&self.dir, credential_id);

        let mut command = Command::new(&self.age_bin);
        command
            .arg("--decrypt")
            .arg("--identity")
            .arg(&self.identity)
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => return Err(DecryptError::Spawn { path, source }),
        };
        debug!(path = %path.display(), pid = ?child.id(), "Spawned age");

        // Dropping the pending wait drops the child, and kill_on_drop reaps it.
        let waited = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline.into(), child.wait_with_output()).await {
                    Ok(waited) => waited,
                    Err(_) => return Err(DecryptError::Timeout { path }),
                }
            }
            None => child.wait_with_output().await,
        };

        let output = match waited {
            Ok(output) => output,
            Err(source) => return Err(DecryptError::Spawn { path, source }),
        };

        if !output.status.success() {
            let diagnostic = stderr_diagnostic(&output);
            // Whatever reached stdout before the failure may be partial plaintext.
            drop(Zeroizing::new(output.stdout));
            return Err(DecryptError::Failed {
                path,
                status: output.status,
                diagnostic,
            });
        }

        Ok(Zeroizing::new(output.stdout))
    }
}

impl Decryptor for AgeDecryptor {
    fn decrypt<'a>(
        &'a self,
        credential_id: &'a str,
        deadline: Option<Instant>,
    ) -> Pin<Box<dyn Future<Output = Result<Zeroizing<Vec<u8>>, DecryptError>> + Send + 'a>>
    {
        Box::pin(self.run(credential_id, deadline))
    }
}

/// First line of the tool's stderr, bounded in length.
fn stderr_diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr.trim().lines().next().unwrap_or_default();
    if line.is_empty() {
        return "no diagnostic output".to_string();
    }

    match line.char_indices().nth(MAX_DIAGNOSTIC_LEN) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}
