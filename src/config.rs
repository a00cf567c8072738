//! Loading and resolving `gatekeeper.json`.
//!
//! The on-disk config is layered: defaults, then the master section, then any
//! categories the builder or master section names, then the builder entry
//! itself. Sets are unioned across layers while scalar values are replaced by
//! the more specific layer. Resolution happens once, at load time, into a
//! [`GatekeeperSection`] per builder per master section.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::build_db::BuildDb;
use crate::errors::ConfigError;

pub const DEFAULT_SUBJECT_TEMPLATE: &str =
    "buildbot %(result)s in %(project_name)s on %(builder_name)s, revision %(revision)s";

pub const DEFAULT_STATUS_TEMPLATE: &str =
    "Tree is closed (Automatic: \"%(unsatisfied)s\" on %(build_url)s \"%(builder_name)s\" from %(blamelist)s)";

/// Wildcard builder name: applies to every builder on the master that has no
/// entry of its own in the same section.
pub const ANY_BUILDER: &str = "*";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    categories: BTreeMap<String, RawSection>,
    #[serde(default)]
    masters: BTreeMap<String, Vec<RawMasterSection>>,
    #[serde(default, rename = "comment")]
    _comment: Option<Value>,
}

/// Keys shared by categories and builder entries.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSection {
    #[serde(default)]
    categories: Option<Vec<String>>,
    #[serde(default)]
    closing_optional: BTreeSet<String>,
    #[serde(default)]
    closing_steps: BTreeSet<String>,
    #[serde(default)]
    excluded_builders: BTreeSet<String>,
    #[serde(default)]
    excluded_steps: BTreeSet<String>,
    #[serde(default)]
    forgive_all: Option<ForgiveAll>,
    #[serde(default)]
    forgiving_optional: BTreeSet<String>,
    #[serde(default)]
    forgiving_steps: BTreeSet<String>,
    #[serde(default)]
    sheriff_classes: BTreeSet<String>,
    #[serde(default)]
    status_template: Option<String>,
    #[serde(default)]
    subject_template: Option<String>,
    #[serde(default)]
    tree_notify: BTreeSet<String>,
    #[serde(default, rename = "comment")]
    _comment: Option<Value>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawMasterSection {
    #[serde(default)]
    builders: BTreeMap<String, RawSection>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    close_tree: Option<bool>,
    #[serde(default)]
    respect_build_status: Option<bool>,
    #[serde(default)]
    excluded_builders: BTreeSet<String>,
    #[serde(default)]
    excluded_steps: BTreeSet<String>,
    #[serde(default)]
    forgive_all: Option<ForgiveAll>,
    #[serde(default)]
    sheriff_classes: BTreeSet<String>,
    #[serde(default)]
    status_template: Option<String>,
    #[serde(default)]
    subject_template: Option<String>,
    #[serde(default)]
    tree_notify: BTreeSet<String>,
    #[serde(default, rename = "comment")]
    _comment: Option<Value>,
}

/// Older configs spell the flag as the string `"true"`.
#[derive(Deserialize, Clone, Copy)]
#[serde(untagged)]
enum ForgiveAll {
    Flag(bool),
    Legacy(LegacyFlag),
}

#[derive(Clone, Copy)]
struct LegacyFlag(bool);

impl<'de> Deserialize<'de> for LegacyFlag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(LegacyFlag(s == "true"))
    }
}

impl ForgiveAll {
    fn enabled(self) -> bool {
        match self {
            ForgiveAll::Flag(flag) | ForgiveAll::Legacy(LegacyFlag(flag)) => flag,
        }
    }
}

/// The fully resolved rules for one builder within one master section.
///
/// Fields are declared in alphabetical order so the JSON rendering used for
/// section hashes has sorted keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GatekeeperSection {
    pub close_tree: bool,
    pub closing_optional: BTreeSet<String>,
    pub closing_steps: BTreeSet<String>,
    pub excluded_builders: BTreeSet<String>,
    pub excluded_steps: BTreeSet<String>,
    pub forgive_all: bool,
    pub forgiving_optional: BTreeSet<String>,
    pub forgiving_steps: BTreeSet<String>,
    pub respect_build_status: bool,
    pub sheriff_classes: BTreeSet<String>,
    pub status_template: String,
    pub subject_template: String,
    pub tree_notify: BTreeSet<String>,
}

impl Default for GatekeeperSection {
    fn default() -> GatekeeperSection {
        GatekeeperSection {
            close_tree: true,
            closing_optional: BTreeSet::new(),
            closing_steps: BTreeSet::new(),
            excluded_builders: BTreeSet::new(),
            excluded_steps: BTreeSet::new(),
            forgive_all: false,
            forgiving_optional: BTreeSet::new(),
            forgiving_steps: BTreeSet::new(),
            respect_build_status: false,
            sheriff_classes: BTreeSet::new(),
            status_template: DEFAULT_STATUS_TEMPLATE.to_string(),
            subject_template: DEFAULT_SUBJECT_TEMPLATE.to_string(),
            tree_notify: BTreeSet::new(),
        }
    }
}

impl GatekeeperSection {
    fn inherit_master(&mut self, master: &RawMasterSection) {
        self.excluded_builders.extend(master.excluded_builders.iter().cloned());
        self.excluded_steps.extend(master.excluded_steps.iter().cloned());
        self.sheriff_classes.extend(master.sheriff_classes.iter().cloned());
        self.tree_notify.extend(master.tree_notify.iter().cloned());
        if let Some(forgive_all) = master.forgive_all {
            self.forgive_all = forgive_all.enabled();
        }
        if let Some(template) = &master.subject_template {
            self.subject_template = template.clone();
        }
        if let Some(template) = &master.status_template {
            self.status_template = template.clone();
        }
        self.close_tree = master.close_tree.unwrap_or(true);
        self.respect_build_status = master.respect_build_status.unwrap_or(false);
    }

    fn inherit(&mut self, raw: &RawSection) {
        self.closing_optional.extend(raw.closing_optional.iter().cloned());
        self.closing_steps.extend(raw.closing_steps.iter().cloned());
        self.excluded_builders.extend(raw.excluded_builders.iter().cloned());
        self.excluded_steps.extend(raw.excluded_steps.iter().cloned());
        self.forgiving_optional.extend(raw.forgiving_optional.iter().cloned());
        self.forgiving_steps.extend(raw.forgiving_steps.iter().cloned());
        self.sheriff_classes.extend(raw.sheriff_classes.iter().cloned());
        self.tree_notify.extend(raw.tree_notify.iter().cloned());
        if let Some(forgive_all) = raw.forgive_all {
            self.forgive_all = forgive_all.enabled();
        }
        if let Some(template) = &raw.subject_template {
            self.subject_template = template.clone();
        }
        if let Some(template) = &raw.status_template {
            self.status_template = template.clone();
        }
    }

    /// With `forgive_all` every closing step becomes a forgiving one.
    fn apply_forgive_all(&mut self) {
        if !self.forgive_all {
            return;
        }
        let closing = std::mem::take(&mut self.closing_steps);
        self.forgiving_steps.extend(closing);
        let closing_optional = std::mem::take(&mut self.closing_optional);
        self.forgiving_optional.extend(closing_optional);
    }
}

/// Merges defaults, master, categories and builder entry, in that order.
/// Categories are applied after the master section, so a scalar set by a
/// category overrides the master's value; sets union regardless of order.
fn resolve(
    master_url: &str,
    master: &RawMasterSection,
    builder_name: &str,
    builder: &RawSection,
    categories: &BTreeMap<String, RawSection>,
) -> Result<GatekeeperSection, ConfigError> {
    let mut section = GatekeeperSection::default();
    section.inherit_master(master);

    let builder_categories = builder.categories.iter().flatten();
    for name in builder_categories.chain(&master.categories) {
        let category = categories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownCategory {
                master: master_url.to_string(),
                builder: builder_name.to_string(),
                category: name.clone(),
            })?;
        section.inherit(category);
    }

    section.inherit(builder);
    section.apply_forgive_all();
    Ok(section)
}

/// One entry of a master's section list, resolved per builder.
#[derive(Clone, Debug, PartialEq)]
pub struct MasterSection {
    pub builders: BTreeMap<String, GatekeeperSection>,
    hash: String,
}

impl MasterSection {
    pub fn new(builders: BTreeMap<String, GatekeeperSection>) -> MasterSection {
        let hash = section_hash(&builders);
        MasterSection { builders, hash }
    }

    /// Stable content hash; the ledger keys debouncing state by it.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The explicit entry for `builder`, falling back to the wildcard entry.
    /// Builders excluded by the chosen entry match nothing.
    pub fn builder_section(&self, builder: &str) -> Option<&GatekeeperSection> {
        let section = self
            .builders
            .get(builder)
            .or_else(|| self.builders.get(ANY_BUILDER))?;
        if section.excluded_builders.contains(builder) {
            return None;
        }
        Some(section)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.builders).unwrap_or(Value::Null)
    }
}

fn section_hash(builders: &BTreeMap<String, GatekeeperSection>) -> String {
    // BTreeMap keys and alphabetically declared fields give sorted-key JSON.
    let rendered = serde_json::to_string(builders).unwrap_or_default();
    hex::encode(Sha256::digest(rendered.as_bytes()))
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatekeeperConfig {
    pub masters: BTreeMap<String, Vec<MasterSection>>,
}

impl GatekeeperConfig {
    pub fn load(path: &Path) -> Result<GatekeeperConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        GatekeeperConfig::parse(&contents, path)
    }

    /// `path` is only used in error messages.
    pub fn parse(contents: &str, path: &Path) -> Result<GatekeeperConfig, ConfigError> {
        let raw: RawConfig = serde_json::from_str(contents).map_err(|source| {
            ConfigError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })?;

        for (name, category) in &raw.categories {
            if category.categories.is_some() {
                return Err(ConfigError::Invalid {
                    path: path.to_path_buf(),
                    reason: format!("category {:?} may not list categories", name),
                });
            }
        }

        let mut masters = BTreeMap::new();
        for (master_url, raw_sections) in &raw.masters {
            let mut sections = Vec::with_capacity(raw_sections.len());
            for raw_section in raw_sections {
                let mut builders = BTreeMap::new();
                for (builder_name, builder) in &raw_section.builders {
                    let resolved =
                        resolve(master_url, raw_section, builder_name, builder, &raw.categories)?;
                    builders.insert(builder_name.clone(), resolved);
                }
                sections.push(MasterSection::new(builders));
            }
            masters.insert(master_url.clone(), sections);
        }
        Ok(GatekeeperConfig { masters })
    }

    pub fn sections(&self, master_url: &str) -> &[MasterSection] {
        self.masters
            .get(master_url)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn section_by_hash(&self, hash: &str) -> Option<&MasterSection> {
        self.masters
            .values()
            .flatten()
            .find(|section| section.hash() == hash)
    }

    /// Errors with every requested master that has no config.
    pub fn check_masters<S: AsRef<str>>(&self, masters: &[S]) -> Result<(), ConfigError> {
        let missing: Vec<String> = masters
            .iter()
            .map(AsRef::as_ref)
            .filter(|m| !self.masters.contains_key(*m))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MastersNotConfigured(missing))
        }
    }

    /// Copies the content of every section the ledger's builds triggered
    /// into `db.sections`, so a later scan can tell what an old hash meant.
    /// Hashes this config no longer has keep whatever was stored before.
    pub fn record_sections(&self, db: &mut BuildDb) {
        for hash in db.referenced_sections() {
            if let Some(section) = self.section_by_hash(&hash) {
                db.sections.insert(hash, section.to_json());
            }
        }
    }

    /// The resolved config as JSON, optionally with each section's hash
    /// injected under `section_hash`.
    pub fn flatten(&self, with_hashes: bool) -> Value {
        let mut out = serde_json::Map::new();
        for (master_url, sections) in &self.masters {
            let rendered = sections
                .iter()
                .map(|section| {
                    let mut value = section.to_json();
                    if let (true, Value::Object(map)) = (with_hashes, &mut value) {
                        map.insert(
                            "section_hash".to_string(),
                            Value::String(section.hash().to_string()),
                        );
                    }
                    value
                })
                .collect();
            out.insert(master_url.clone(), Value::Array(rendered));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<GatekeeperConfig, ConfigError> {
        GatekeeperConfig::parse(json, Path::new("gatekeeper.json"))
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    const MASTER: &str = "http://build.example.com/p/chromium";

    #[test]
    fn layers_merge_in_order() {
        let cfg = parse(
            r#"{
              "categories": {
                "testers": {
                  "closing_steps": ["tests"],
                  "subject_template": "category %(builder_name)s",
                  "tree_notify": ["cat@example.com"]
                }
              },
              "masters": {
                "http://build.example.com/p/chromium": [{
                  "tree_notify": ["master@example.com"],
                  "subject_template": "master %(builder_name)s",
                  "builders": {
                    "Linux": {
                      "categories": ["testers"],
                      "closing_steps": ["compile"]
                    },
                    "Mac": {
                      "categories": ["testers"],
                      "subject_template": "builder %(builder_name)s"
                    }
                  }
                }]
              }
            }"#,
        )
        .unwrap();
        let section = &cfg.sections(MASTER)[0];
        let linux = section.builder_section("Linux").unwrap();
        assert_eq!(linux.closing_steps, set(&["compile", "tests"]));
        assert_eq!(linux.tree_notify, set(&["cat@example.com", "master@example.com"]));
        assert_eq!(linux.subject_template, "category %(builder_name)s");
        assert!(linux.close_tree);
        assert!(!linux.respect_build_status);

        let mac = section.builder_section("Mac").unwrap();
        assert_eq!(mac.subject_template, "builder %(builder_name)s");
    }

    #[test]
    fn master_categories_apply_to_every_builder() {
        let cfg = parse(
            r#"{
              "categories": {"base": {"excluded_steps": ["update_scripts"]}},
              "masters": {
                "http://build.example.com/p/chromium": [{
                  "categories": ["base"],
                  "close_tree": false,
                  "builders": {"*": {"closing_optional": ["*"]}}
                }]
              }
            }"#,
        )
        .unwrap();
        let section = cfg.sections(MASTER)[0].builder_section("anything").unwrap();
        assert_eq!(section.excluded_steps, set(&["update_scripts"]));
        assert_eq!(section.closing_optional, set(&["*"]));
        assert!(!section.close_tree);
    }

    #[test]
    fn forgive_all_moves_closing_into_forgiving() {
        for flag in &["true", "\"true\""] {
            let cfg = parse(&format!(
                r#"{{"masters": {{"http://build.example.com/p/chromium": [{{
                    "forgive_all": {},
                    "builders": {{"Linux": {{
                      "closing_steps": ["compile"],
                      "closing_optional": ["tests"]
                    }}}}
                }}]}}}}"#,
                flag
            ))
            .unwrap();
            let section = cfg.sections(MASTER)[0].builder_section("Linux").unwrap();
            assert!(section.closing_steps.is_empty());
            assert!(section.closing_optional.is_empty());
            assert_eq!(section.forgiving_steps, set(&["compile"]));
            assert_eq!(section.forgiving_optional, set(&["tests"]));
        }
    }

    #[test]
    fn builder_overrides_forgive_all() {
        let cfg = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [{
                "forgive_all": "true",
                "builders": {"Linux": {"forgive_all": false, "closing_steps": ["compile"]}}
            }]}}"#,
        )
        .unwrap();
        let section = cfg.sections(MASTER)[0].builder_section("Linux").unwrap();
        assert_eq!(section.closing_steps, set(&["compile"]));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [{
                "builders": {"Linux": {"closing_stpes": ["compile"]}}
            }]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }), "{}", err);

        let err = parse(r#"{"mastrs": {}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }), "{}", err);
    }

    #[test]
    fn comments_are_allowed_everywhere() {
        parse(
            r#"{"comment": "top", "categories": {"c": {"comment": "cat"}},
                "masters": {"http://build.example.com/p/chromium": [{
                  "comment": "master",
                  "builders": {"Linux": {"comment": "builder"}}
                }]}}"#,
        )
        .unwrap();
    }

    #[test]
    fn mistyped_values_are_rejected() {
        let err = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [{
                "builders": {"Linux": {"closing_steps": "compile"}}
            }]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn unknown_category_is_an_error() {
        let err = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [{
                "builders": {"Linux": {"categories": ["nope"]}}
            }]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCategory { .. }));
    }

    #[test]
    fn categories_cannot_nest() {
        let err = parse(r#"{"categories": {"a": {"categories": ["b"]}, "b": {}}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn explicit_builder_beats_wildcard() {
        let cfg = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [{
                "builders": {
                  "*": {"closing_steps": ["compile"], "excluded_builders": ["Flaky"]},
                  "Linux": {"closing_steps": ["tests"]}
                }
            }]}}"#,
        )
        .unwrap();
        let section = &cfg.sections(MASTER)[0];
        assert_eq!(section.builder_section("Linux").unwrap().closing_steps, set(&["tests"]));
        assert_eq!(section.builder_section("Mac").unwrap().closing_steps, set(&["compile"]));
        assert!(section.builder_section("Flaky").is_none());
    }

    #[test]
    fn hashes_track_content() {
        let a = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [
                {"builders": {"Linux": {"closing_steps": ["compile"]}}},
                {"builders": {"Linux": {"closing_steps": ["tests"]}}}
            ]}}"#,
        )
        .unwrap();
        let b = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [
                {"builders": {"Linux": {"closing_steps": ["compile"]}}}
            ]}}"#,
        )
        .unwrap();
        let a_sections = a.sections(MASTER);
        assert_ne!(a_sections[0].hash(), a_sections[1].hash());
        assert_eq!(a_sections[0].hash(), b.sections(MASTER)[0].hash());
        assert_eq!(a_sections[0].hash().len(), 64);
        assert!(a.section_by_hash(a_sections[1].hash()).is_some());
    }

    #[test]
    fn missing_masters_are_reported() {
        let cfg = parse(r#"{"masters": {"http://build.example.com/p/chromium": []}}"#).unwrap();
        assert!(cfg.check_masters(&[MASTER]).is_ok());
        match cfg.check_masters(&[MASTER, "http://build.example.com/p/other"]) {
            Err(ConfigError::MastersNotConfigured(missing)) => {
                assert_eq!(missing, vec!["http://build.example.com/p/other".to_string()])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn flatten_injects_hashes() {
        let cfg = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [
                {"builders": {"Linux": {"closing_steps": ["compile"]}}}
            ]}}"#,
        )
        .unwrap();
        let flat = cfg.flatten(true);
        let section = &flat[MASTER][0];
        assert_eq!(section["section_hash"], cfg.sections(MASTER)[0].hash());
        assert_eq!(section["Linux"]["closing_steps"], serde_json::json!(["compile"]));
        assert!(cfg.flatten(false)[MASTER][0].get("section_hash").is_none());
    }

    #[test]
    fn triggered_sections_are_recorded() {
        use crate::build_db::BuildKey;

        let cfg = parse(
            r#"{"masters": {"http://build.example.com/p/chromium": [
                {"builders": {"Linux": {"closing_steps": ["compile"]}}}
            ]}}"#,
        )
        .unwrap();
        let hash = cfg.sections(MASTER)[0].hash().to_string();
        let mut db = BuildDb::new();
        let key = BuildKey::new(MASTER, "Linux", 7);
        let steps = vec!["compile".to_string()];
        db.record_trigger(&key, &hash, &steps);
        db.record_trigger(&key, "gone", &steps);
        db.sections.insert("gone".to_string(), serde_json::json!({"old": true}));

        cfg.record_sections(&mut db);
        assert_eq!(db.sections[&hash], cfg.sections(MASTER)[0].to_json());
        assert_eq!(db.sections["gone"], serde_json::json!({"old": true}));
    }

    #[test]
    fn sample_config_loads() {
        let path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config/gatekeeper.json"));
        let cfg = GatekeeperConfig::load(path).unwrap();
        let linux = &cfg.sections("http://build.chromium.org/p/chromium.linux")[0];
        let tests = linux.builder_section("Linux Tests").unwrap();
        assert!(tests.closing_optional.contains("compile"));
        assert!(tests.closing_optional.contains("unit_tests"));
        assert!(tests.excluded_steps.contains("archive_build"));
        assert_eq!(cfg.sections("http://build.chromium.org/p/chromium.win").len(), 2);
    }
}
