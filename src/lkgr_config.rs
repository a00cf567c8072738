//! Which builders and steps have to be green for each LKGR project.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::errors::ConfigError;

/// A required step. A step that was renamed is listed with all of its
/// names; a build may carry at most one of them.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    One(String),
    AnyOf(Vec<String>),
}

impl StepSpec {
    pub fn matches(&self, step_name: &str) -> bool {
        match self {
            StepSpec::One(name) => name == step_name,
            StepSpec::AnyOf(names) => names.iter().any(|n| n == step_name),
        }
    }
}

impl fmt::Display for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepSpec::One(name) => f.write_str(name),
            StepSpec::AnyOf(names) => write!(f, "({})", names.join(" | ")),
        }
    }
}

impl From<&str> for StepSpec {
    fn from(name: &str) -> StepSpec {
        StepSpec::One(name.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterSteps {
    /// Base URL of the master, e.g. `http://build.chromium.org/p/chromium.linux`.
    pub url: String,
    #[serde(default)]
    pub builders: BTreeMap<String, Vec<StepSpec>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Status app serving `/lkgr` and accepting `/revisions`.
    pub revisions_url: String,
    #[serde(default)]
    pub svn_url: Option<String>,
    /// Keyed by the short master name used in build data dumps.
    #[serde(default)]
    pub masters: BTreeMap<String, MasterSteps>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LkgrConfig {
    #[serde(default)]
    pub projects: BTreeMap<String, Project>,
}

impl LkgrConfig {
    pub fn load(path: &Path) -> Result<LkgrConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        LkgrConfig::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Path) -> Result<LkgrConfig, ConfigError> {
        let config: LkgrConfig =
            toml::from_str(contents).map_err(|source| ConfigError::MalformedToml {
                path: path.to_path_buf(),
                source,
            })?;
        for (name, project) in &config.projects {
            if project.masters.values().all(|m| m.builders.is_empty()) {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("project {} has no builders", name),
                });
            }
        }
        Ok(config)
    }

    pub fn project(&self, name: &str) -> Result<&Project, ConfigError> {
        self.projects
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProject(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[projects.chromium]
revisions_url = "https://chromium-status.appspot.com"
svn_url = "svn://svn.chromium.org/chrome"

[projects.chromium.masters."chromium.linux"]
url = "http://build.chromium.org/p/chromium.linux"
builders = { "Linux Builder" = ["compile", ["checkdeps", "check_deps"]] }

[projects.v8]
revisions_url = "https://v8-status.appspot.com"

[projects.v8.masters."client.v8"]
url = "http://build.chromium.org/p/client.v8"
builders = { "V8 Linux" = ["Check"] }
"#;

    #[test]
    fn parses_projects() {
        let config = LkgrConfig::parse(CONFIG, Path::new("lkgr.toml")).unwrap();
        let chromium = config.project("chromium").unwrap();
        assert_eq!(chromium.svn_url.as_deref(), Some("svn://svn.chromium.org/chrome"));
        let steps = &chromium.masters["chromium.linux"].builders["Linux Builder"];
        assert_eq!(steps[0], StepSpec::from("compile"));
        assert!(steps[1].matches("check_deps"));
        assert!(!steps[1].matches("compile"));
        assert_eq!(steps[1].to_string(), "(checkdeps | check_deps)");
        assert_eq!(config.project("v8").unwrap().svn_url, None);
    }

    #[test]
    fn unknown_project() {
        let config = LkgrConfig::parse(CONFIG, Path::new("lkgr.toml")).unwrap();
        assert!(matches!(
            config.project("webrtc"),
            Err(ConfigError::UnknownProject(name)) if name == "webrtc"
        ));
    }

    #[test]
    fn rejects_unknown_keys_and_empty_projects() {
        let bad = "[projects.x]\nrevisions_url = \"u\"\nrevision_url = \"typo\"\n";
        assert!(matches!(
            LkgrConfig::parse(bad, Path::new("lkgr.toml")),
            Err(ConfigError::MalformedToml { .. })
        ));
        let empty = "[projects.x]\nrevisions_url = \"u\"\n";
        assert!(matches!(
            LkgrConfig::parse(empty, Path::new("lkgr.toml")),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn sample_config_loads() {
        let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config/lkgr.toml"));
        let config = LkgrConfig::load(path).unwrap();
        let linux = &config.project("chromium").unwrap().masters["chromium.linux"];
        assert!(linux.builders["Linux Builder"][0].matches("check_deps"));
        assert_eq!(config.project("v8").unwrap().masters.len(), 1);
    }
}
