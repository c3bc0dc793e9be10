//! Cron entries that drive `relay-ci changecheck` for polled repos.

use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::models::poll::PollRequest;

pub const DEFAULT_SCRIPT: &str = "/bin/run_changecheck.sh";

/// A schedule needs five whitespace-separated fields.
pub fn validate_schedule(cron: &str) -> Result<()> {
    let fields = cron.split_whitespace().count();
    if fields != 5 {
        return Err(Error::Validation(format!(
            "cron string {cron:?} must have 5 fields, found {fields}"
        )));
    }
    Ok(())
}

pub fn cron_line(poll: &PollRequest, script: &str) -> String {
    format!(
        "{} root {} {} {}\n",
        poll.cron,
        script,
        poll.acct_repo(),
        poll.branches_joined()
    )
}

#[derive(Debug, Clone)]
pub struct CronWriter {
    dir: PathBuf,
    script: String,
}

impl CronWriter {
    pub fn new(dir: impl Into<PathBuf>, script: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            script: script.into(),
        }
    }

    pub fn path_for(&self, account: &str, repo: &str) -> PathBuf {
        self.dir.join(format!("{account}_{repo}"))
    }

    pub async fn write(&self, poll: &PollRequest) -> Result<PathBuf> {
        validate_schedule(&poll.cron)?;
        let path = self.path_for(&poll.account, &poll.repo);
        tokio::fs::write(&path, cron_line(poll, &self.script))
            .await
            .map_err(|e| Error::Internal(format!("unable to write {}: {e}", path.display())))?;
        tracing::info!(acct_repo = %poll.acct_repo(), path = %path.display(), "Cron entry written");
        Ok(path)
    }

    /// Remove the entry; a missing file is fine.
    pub async fn remove(&self, account: &str, repo: &str) -> Result<()> {
        let path = self.path_for(account, repo);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(format!(
                "unable to remove {}: {e}",
                path.display()
            ))),
        }
    }
}
