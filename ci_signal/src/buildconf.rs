//! Fetch the build definition at a commit and check it can build at all.

use crate::error::{Error, Result};
use crate::models::build_config::{BuildConfig, BUILD_FILE, BUILD_STAGE};
use crate::vcs::VcsHandler;

/// Fetch `ocelot.yml` at `commit` and parse it.
///
/// A missing file comes back as `FileNotFound` so callers can treat it
/// as "nothing to build"; fetch and parse failures propagate as-is. A
/// config without a build stage is `NotViable`.
pub async fn fetch_and_validate(
    handler: &dyn VcsHandler,
    repo: &str,
    commit: &str,
) -> Result<BuildConfig> {
    let bytes = match handler.get_file(BUILD_FILE, repo, commit).await {
        Ok(bytes) => bytes,
        Err(e @ Error::FileNotFound { .. }) => {
            tracing::debug!(acct_repo = %repo, commit = %commit, "no {BUILD_FILE} found");
            return Err(e);
        }
        Err(e) => {
            tracing::error!(acct_repo = %repo, commit = %commit, "unable to get build conf: {e}");
            return Err(e);
        }
    };

    let conf = BuildConfig::from_yaml(&bytes).inspect_err(|e| {
        tracing::error!(acct_repo = %repo, commit = %commit, "unable to parse build conf: {e}");
    })?;

    if !conf.has_build_stage() {
        return Err(Error::NotViable(format!(
            "no {BUILD_STAGE} stage defined in {BUILD_FILE} at {commit}"
        )));
    }
    Ok(conf)
}
