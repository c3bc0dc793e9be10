//! The build/no-build decision for one trigger.

use crate::models::build_config::{BuildConfig, BUILD_STAGE};
use crate::models::trigger::Commit;

/// Commit-message markers that opt a push out of CI.
pub const SKIP_MARKERS: [&str; 2] = ["[skip ci]", "[ci skip]"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viability {
    Viable,
    NotViable(String),
}

impl Viability {
    pub fn is_viable(&self) -> bool {
        matches!(self, Viability::Viable)
    }
}

/// Decide whether `branch` should build under `conf`.
///
/// A config without a build stage never builds. Otherwise the branch
/// must match a filter literally (or the filter list holds `ALL`), and
/// no commit may carry a skip marker. `force` lifts the branch and skip
/// checks only.
pub fn check(conf: &BuildConfig, branch: &str, force: bool, commits: &[Commit]) -> Viability {
    if !conf.has_build_stage() {
        return Viability::NotViable(format!("no {BUILD_STAGE} stage defined"));
    }
    if force {
        return Viability::Viable;
    }
    if !conf.matches_branch(branch) {
        return Viability::NotViable(format!(
            "build does not match any branches listed: {:?}",
            conf.branches
        ));
    }
    if let Some(commit) = commits.iter().find(|c| has_skip_marker(&c.message)) {
        return Viability::NotViable(format!(
            "commit {} asked to skip ci",
            commit.hash
        ));
    }
    Viability::Viable
}

fn has_skip_marker(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    SKIP_MARKERS.iter().any(|m| lower.contains(m))
}
