//! Buildbot JSON API shapes and the build records the engines work on.

use std::collections::BTreeMap;
use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Buildbot result codes, in the numbering the JSON API uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuildResult {
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Retry,
}

impl BuildResult {
    pub fn from_code(code: i64) -> Option<BuildResult> {
        Some(match code {
            0 => BuildResult::Success,
            1 => BuildResult::Warnings,
            2 => BuildResult::Failure,
            3 => BuildResult::Skipped,
            4 => BuildResult::Exception,
            5 => BuildResult::Retry,
            _ => return None,
        })
    }

    pub fn code(self) -> i64 {
        match self {
            BuildResult::Success => 0,
            BuildResult::Warnings => 1,
            BuildResult::Failure => 2,
            BuildResult::Skipped => 3,
            BuildResult::Exception => 4,
            BuildResult::Retry => 5,
        }
    }

    /// SUCCESS < WARNINGS < FAILURE < EXCEPTION. Skipped steps rank with
    /// successes, retries with exceptions.
    fn severity(self) -> u8 {
        match self {
            BuildResult::Success | BuildResult::Skipped => 0,
            BuildResult::Warnings => 1,
            BuildResult::Failure => 2,
            BuildResult::Exception | BuildResult::Retry => 3,
        }
    }

    /// Folds two results into the more severe one; on a tie `other` wins.
    pub fn combine(self, other: BuildResult) -> BuildResult {
        if other.severity() >= self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildResult::Success => "success",
            BuildResult::Warnings => "warnings",
            BuildResult::Failure => "failure",
            BuildResult::Skipped => "skipped",
            BuildResult::Exception => "exception",
            BuildResult::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// `<master>/json`, only the parts we read.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MasterJson {
    #[serde(default)]
    pub builders: BTreeMap<String, BuilderJson>,
    #[serde(default)]
    pub project: ProjectJson,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderJson {
    #[serde(default)]
    pub cached_builds: Vec<u64>,
    #[serde(default)]
    pub current_builds: Vec<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProjectJson {
    #[serde(default)]
    pub title: Option<String>,
}

/// `<master>/json/builders/<builder>/builds/<n>`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJson {
    #[serde(default)]
    pub builder_name: String,
    #[serde(default)]
    pub number: u64,
    /// Absent until the build finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<i64>,
    #[serde(default)]
    pub steps: Vec<StepJson>,
    #[serde(default)]
    pub blame: Vec<String>,
    #[serde(default)]
    pub source_stamp: SourceStamp,
    #[serde(default)]
    pub from_addr: Option<String>,
    /// `[start, end]` as unix timestamps; end is null while running.
    #[serde(default)]
    pub times: Vec<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    /// `[name, value, source]` triples.
    #[serde(default)]
    pub properties: Vec<Vec<Value>>,
    #[serde(default)]
    pub current_step: Option<Value>,
    #[serde(default)]
    pub text: Vec<Value>,
}

impl BuildJson {
    pub fn finished(&self) -> bool {
        self.results.is_some()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|prop| prop.first().and_then(Value::as_str) == Some(name))
            .and_then(|prop| prop.get(1))
    }

    /// `got_revision` if the checkout reported one, otherwise the revision
    /// the build was requested at.
    pub fn revision(&self) -> Option<String> {
        self.property("got_revision")
            .and_then(value_to_revision)
            .or_else(|| self.source_stamp.revision.as_ref().and_then(value_to_revision))
    }

    pub fn text_contains(&self, word: &str) -> bool {
        self.text.iter().any(|t| t.as_str() == Some(word))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepJson {
    pub name: String,
    #[serde(default)]
    pub text: Vec<Value>,
    /// `[code, [text...]]`; the code is null until the step finishes.
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub is_started: bool,
    #[serde(default)]
    pub is_finished: bool,
    #[serde(default)]
    pub logs: Vec<Value>,
    #[serde(default)]
    pub urls: Value,
}

impl StepJson {
    /// The raw result code. Old masters nest it one list deeper.
    pub fn result_code(&self) -> Option<i64> {
        match self.results.first()? {
            Value::Number(n) => n.as_i64(),
            Value::Array(inner) => inner.first().and_then(Value::as_i64),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub revision: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceStamp {
    #[serde(default)]
    pub revision: Option<Value>,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn value_to_revision(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub name: String,
    pub status: Option<BuildResult>,
    pub started: bool,
    pub finished: bool,
    pub text: Vec<Value>,
    pub logs: Vec<Value>,
    pub urls: Value,
    pub results: Vec<Value>,
}

impl From<StepJson> for StepResult {
    fn from(step: StepJson) -> StepResult {
        StepResult {
            status: step.result_code().and_then(BuildResult::from_code),
            name: step.name,
            started: step.is_started,
            finished: step.is_finished,
            text: step.text,
            logs: step.logs,
            urls: step.urls,
            results: step.results,
        }
    }
}

/// One build as observed from a master.
#[derive(Clone, Debug)]
pub struct BuildRecord {
    pub master_url: String,
    pub project_name: String,
    pub builder_name: String,
    pub build_number: u64,
    /// Overall result; `None` while the build is running.
    pub result: Option<BuildResult>,
    pub steps: Vec<StepResult>,
    pub blamelist: Vec<String>,
    pub changes: Vec<Change>,
    pub reason: Option<String>,
    pub from_addr: Option<String>,
    pub start_time: Option<f64>,
    pub properties: Vec<Vec<Value>>,
    pub revision: Option<String>,
}

impl BuildRecord {
    pub fn from_json(master_url: &str, project_name: &str, build: BuildJson) -> BuildRecord {
        let revision = build.revision();
        BuildRecord {
            master_url: master_url.to_string(),
            project_name: project_name.to_string(),
            builder_name: build.builder_name,
            build_number: build.number,
            result: build.results.and_then(BuildResult::from_code),
            steps: build.steps.into_iter().map(StepResult::from).collect(),
            blamelist: build.blame,
            changes: build.source_stamp.changes,
            reason: build.reason,
            from_addr: build.from_addr,
            start_time: build.times.first().and_then(Value::as_f64),
            properties: build.properties,
            revision,
        }
    }

    pub fn finished(&self) -> bool {
        self.result.is_some()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .find(|prop| prop.first().and_then(Value::as_str) == Some(name))
            .and_then(|prop| prop.get(1))
    }

    /// The most severe result over the finished steps.
    pub fn combined_step_result(&self) -> BuildResult {
        self.steps
            .iter()
            .filter(|s| s.finished)
            .filter_map(|s| s.status)
            .fold(BuildResult::Success, BuildResult::combine)
    }

    pub fn url(&self) -> String {
        build_url(&self.master_url, &self.builder_name, self.build_number)
    }
}

/// Appends percent-encoded path segments to a master URL.
pub fn master_path(master_url: &str, segments: &[&str]) -> Option<String> {
    let mut url = Url::parse(master_url).ok()?;
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(segments);
    Some(url.to_string())
}

pub fn build_url(master_url: &str, builder: &str, number: u64) -> String {
    let number = number.to_string();
    master_path(master_url, &["builders", builder, "builds", &number])
        .unwrap_or_else(|| format!("{}/builders/{}/builds/{}", master_url, builder, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_takes_most_severe() {
        use BuildResult::*;
        assert_eq!(Success.combine(Failure), Failure);
        assert_eq!(Failure.combine(Warnings), Failure);
        assert_eq!(Failure.combine(Exception), Exception);
        assert_eq!(Success.combine(Skipped), Skipped);
        assert_eq!(Exception.combine(Retry), Retry);
    }

    #[test]
    fn combined_step_result_skips_unfinished_steps() {
        let step = |name: &str, finished: bool, status: Option<BuildResult>| StepResult {
            name: name.to_string(),
            status,
            started: true,
            finished,
            text: vec![],
            logs: vec![],
            urls: Value::Null,
            results: vec![],
        };
        let mut record = BuildRecord::from_json(
            "http://build.example.com/p/chromium",
            "Chromium",
            BuildJson::default(),
        );
        assert_eq!(record.combined_step_result(), BuildResult::Success);

        record.steps = vec![
            step("update", true, Some(BuildResult::Success)),
            step("compile", true, Some(BuildResult::Warnings)),
            step("tests", false, Some(BuildResult::Exception)),
        ];
        assert_eq!(record.combined_step_result(), BuildResult::Warnings);

        record.steps.push(step("archive", true, Some(BuildResult::Failure)));
        record.steps.push(step("upload", true, None));
        assert_eq!(record.combined_step_result(), BuildResult::Failure);
    }

    #[test]
    fn parses_running_build() {
        let json = r#"{
            "builderName": "Linux Tests",
            "number": 12,
            "blame": ["a@chromium.org"],
            "currentStep": {"name": "compile"},
            "properties": [["got_revision", "abc123", "Source"], ["buildnumber", 12, "Build"]],
            "sourceStamp": {"revision": "999", "branch": "src"},
            "steps": [
                {"name": "update", "isStarted": true, "isFinished": true, "results": [0, []]},
                {"name": "compile", "isStarted": true, "isFinished": false, "results": [null, []]}
            ]
        }"#;
        let build: BuildJson = serde_json::from_str(json).unwrap();
        assert!(!build.finished());
        assert_eq!(build.revision().as_deref(), Some("abc123"));
        assert_eq!(build.steps[0].result_code(), Some(0));
        assert_eq!(build.steps[1].result_code(), None);

        let record = BuildRecord::from_json("http://build.example.com/p/chromium", "Chromium", build);
        assert_eq!(record.steps[0].status, Some(BuildResult::Success));
        assert_eq!(record.revision.as_deref(), Some("abc123"));
        assert_eq!(
            record.url(),
            "http://build.example.com/p/chromium/builders/Linux%20Tests/builds/12"
        );
    }

    #[test]
    fn nested_result_codes() {
        let step = StepJson {
            name: "compile".to_string(),
            results: vec![serde_json::json!([2, "failed"])],
            ..StepJson::default()
        };
        assert_eq!(step.result_code(), Some(2));
    }

    #[test]
    fn revision_falls_back_to_source_stamp() {
        let build = BuildJson {
            source_stamp: SourceStamp {
                revision: Some(serde_json::json!(1234)),
                ..SourceStamp::default()
            },
            ..BuildJson::default()
        };
        assert_eq!(build.revision().as_deref(), Some("1234"));
    }
}
