//! Parsed build definition (`ocelot.yml`).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Conventional path of the build definition inside a repository.
pub const BUILD_FILE: &str = "ocelot.yml";

/// The stage every buildable config must define.
pub const BUILD_STAGE: &str = "build";

/// Branch filter matching every branch.
pub const ALL_BRANCHES: &str = "ALL";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub machine_tag: String,
    #[serde(default)]
    pub build_tool: String,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Stages in execution order. Required, so a document that is not a
    /// build definition fails to parse.
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

impl BuildConfig {
    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn has_build_stage(&self) -> bool {
        self.stage(BUILD_STAGE).is_some()
    }

    /// Literal match against the branch filters; `ALL` matches anything.
    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branches
            .iter()
            .any(|b| b == ALL_BRANCHES || b == branch)
    }

    /// Structural checks beyond the build stage.
    pub fn validate(&self) -> Result<()> {
        if self.build_tool.trim().is_empty() {
            return Err(Error::Validation(
                "BuildTool must be specified".to_string(),
            ));
        }
        if self.image.trim().is_empty() && self.machine_tag.trim().is_empty() {
            return Err(Error::Validation(
                "there is no image and no machineTag listed in the build file".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(Error::Validation("every stage needs a name".to_string()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::Validation(format!(
                    "stage {} is defined more than once",
                    stage.name
                )));
            }
            if stage.script.is_empty() {
                return Err(Error::Validation(format!(
                    "stage {} has no script lines",
                    stage.name
                )));
            }
        }

        if let Some(bad) = self.branches.iter().find(|b| b.trim() != b.as_str()) {
            return Err(Error::Validation(format!(
                "branch filter {bad:?} has surrounding whitespace"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
image: golang:1.21
buildTool: go
branches:
  - main
  - release
env:
  - CGO_ENABLED=0
stages:
  - name: build
    script:
      - go build ./...
  - name: test
    script:
      - go test ./...
"#;

    #[test]
    fn parses_stages_in_order() {
        let conf = BuildConfig::from_yaml(SAMPLE.as_bytes()).unwrap();
        let names: Vec<_> = conf.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["build", "test"]);
        assert_eq!(conf.build_tool, "go");
        assert!(conf.has_build_stage());
        conf.validate().unwrap();
    }

    #[test]
    fn wildcard_matches_every_branch() {
        let conf = BuildConfig {
            branches: vec![ALL_BRANCHES.to_string()],
            ..Default::default()
        };
        assert!(conf.matches_branch("anything"));
        assert!(conf.matches_branch(""));
    }

    #[test]
    fn missing_build_tool_is_invalid() {
        let mut conf = BuildConfig::from_yaml(SAMPLE.as_bytes()).unwrap();
        conf.build_tool.clear();
        assert!(matches!(conf.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn duplicate_stage_names_are_invalid() {
        let mut conf = BuildConfig::from_yaml(SAMPLE.as_bytes()).unwrap();
        conf.stages[1].name = "build".into();
        let err = conf.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn document_without_stages_is_a_parse_error() {
        let metadata = br#"{"type": "file", "name": "ocelot.yml", "path": "ocelot.yml", "sha": "3d21ec53", "size": 220, "encoding": "base64", "content": "aW1hZ2U6IGFscGluZQo="}"#;
        let err = BuildConfig::from_yaml(metadata).unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = BuildConfig::from_yaml(b"stages: [unclosed").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}
