//! Finds the last known good revision across a set of builders.
//!
//! Walking backward from the newest revision, a builder is green at a
//! revision when it built exactly that revision successfully, or when the
//! closest builds on either side of it both succeeded. The newest revision
//! that every builder is green at is the LKGR candidate.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;
use std::iter::Rev;
use std::slice;

use chrono::Duration;
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::Url;

use crate::build_scan::{parallel_map, BuildSource};
use crate::buildbot::{master_path, BuildJson};
use crate::errors::{FetchError, NotificationError};
use crate::lkgr_config::{MasterSteps, Project, StepSpec};
use crate::notify::{check_response, http_err};
use crate::revision::RevisionOrder;

/// Numeric revisions further than this below the newest one are bogus.
pub const SANITY_BOUND: i64 = 10_000;

pub const DEFAULT_ALLOWED_GAP: i64 = 150;
pub const DEFAULT_ALLOWED_LAG_HOURS: i64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Unknown,
    Success,
    Failure,
    InProgress,
}

impl Status {
    /// CSS class used by the HTML report.
    pub fn class(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::InProgress => "inprogress",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class())
    }
}

/// Master name → builder name → build number → build, as served by
/// `/json/builders/<builder>/builds/_all` and as dumped with
/// `--dump-build-data`.
pub type BuildData = BTreeMap<String, BTreeMap<String, BTreeMap<String, BuildJson>>>;

#[derive(Clone, Debug, PartialEq)]
pub struct RevisionHistoryEntry {
    pub revision: String,
    pub status: Status,
    pub build_number: u64,
}

/// Master name → builder name → builds sorted oldest revision first.
pub type BuildHistory = BTreeMap<String, BTreeMap<String, Vec<RevisionHistoryEntry>>>;

/// Decides how one build fares against a builder's required steps. Also
/// returns the reasons for anything short of success.
pub fn evaluate_build(build: &BuildJson, required: &[StepSpec]) -> (Status, Vec<String>) {
    let mut status = Status::Success;
    let mut reasons = Vec::new();
    for spec in required {
        // Later steps of the same name shadow earlier ones.
        let matching: BTreeMap<&str, _> = build
            .steps
            .iter()
            .filter(|step| spec.matches(&step.name))
            .map(|step| (step.name.as_str(), step))
            .collect();
        let steps: Vec<_> = matching.values().collect();
        match steps.as_slice() {
            [] => reasons.push(format!("Step {} is not listed on the build.", spec)),
            [step] => {
                if step.is_finished && !step.results.is_empty() {
                    if let Some(code) = step.result_code() {
                        if code != 0 && code != 1 {
                            reasons.push(format!("Step {} failed", step.name));
                            status = Status::Failure;
                        }
                    }
                    continue;
                }
                reasons.push(format!(
                    "Step {} has not completed (isFinished: {})",
                    step.name, step.is_finished
                ));
            }
            _ => {
                let names: Vec<&str> = matching.keys().copied().collect();
                reasons.push(format!("Multiple step matches: {}", names.join(", ")));
                status = Status::Failure;
                continue;
            }
        }
        status = if build.current_step.is_some() && status != Status::Failure {
            Status::InProgress
        } else {
            Status::Failure
        };
    }
    (status, reasons)
}

/// Organizes raw build data into per-builder histories and the sorted list
/// of every revision seen. Only builders named in `masters` are kept.
pub fn collate_revision_history(
    data: &BuildData,
    masters: &BTreeMap<String, MasterSteps>,
    order: &dyn RevisionOrder,
) -> (BuildHistory, Vec<String>) {
    let mut history = BuildHistory::new();
    let mut seen = BTreeSet::new();
    for (master, builders) in data {
        let Some(master_steps) = masters.get(master) else {
            continue;
        };
        let master_history = history.entry(master.clone()).or_default();
        for (builder, builds) in builders {
            let Some(required) = master_steps.builders.get(builder) else {
                continue;
            };
            let mut numbered: Vec<(u64, &BuildJson)> = builds
                .iter()
                .filter_map(|(number, build)| Some((number.parse().ok()?, build)))
                .collect();
            numbered.sort_by_key(|(number, _)| *number);

            let mut entries = Vec::new();
            for (number, build) in numbered {
                if build.text_contains("exception")
                    && build.text_contains("slave")
                    && build.text_contains("lost")
                {
                    debug!("{} build {}: lost slave, skipping", builder, number);
                    continue;
                }
                let Some(revision) = build.revision() else {
                    continue;
                };
                if !order.check(&revision) {
                    debug!("{} build {}: bad revision {:?}", builder, number, revision);
                    continue;
                }
                let (status, reasons) = evaluate_build(build, required);
                for reason in &reasons {
                    debug!("{} build {} at {}: {}", builder, number, revision, reason);
                }
                seen.insert(revision.clone());
                entries.push(RevisionHistoryEntry {
                    revision,
                    status,
                    build_number: number,
                });
            }
            entries.sort_by(|a, b| order.cmp(&a.revision, &b.revision));
            master_history.insert(builder.clone(), entries);
        }
    }

    let mut revisions: Vec<String> = seen.into_iter().collect();
    revisions.sort_by(|a, b| order.cmp(a, b));
    if let Some(newest) = revisions.last().and_then(|r| order.numeric(r)) {
        let first_good = revisions
            .iter()
            .position(|r| order.numeric(r).map_or(true, |n| newest - n <= SANITY_BOUND))
            .unwrap_or(revisions.len());
        if first_good > 0 {
            warn!("dropping {} implausibly old revisions", first_good);
            revisions.drain(..first_good);
        }
    }
    (history, revisions)
}

/// Receives the sweep as it happens: every master and builder once, then
/// one row per revision, newest first.
pub trait StatusObserver {
    fn master(&mut self, _master: &str) {}
    fn builder(&mut self, _builder: &str) {}
    fn revision(&mut self, _revision: &str) {}
    fn build(&mut self, _master: &str, _builder: &str, _status: Status, _build_number: Option<u64>) {}
    fn lkgr(&mut self, _revision: &str) {}
}

/// Ignores everything.
pub struct NullObserver;

impl StatusObserver for NullObserver {}

struct Cursor<'h> {
    master: &'h str,
    builder: &'h str,
    pending: Rev<slice::Iter<'h, RevisionHistoryEntry>>,
    /// Builds passed so far, newest first; `None` once history runs out.
    seen: Vec<Option<&'h RevisionHistoryEntry>>,
}

impl<'h> Cursor<'h> {
    fn new(master: &'h str, builder: &'h str, entries: &'h [RevisionHistoryEntry]) -> Cursor<'h> {
        let mut pending = entries.iter().rev();
        let first = pending.next();
        Cursor {
            master,
            builder,
            pending,
            seen: vec![first],
        }
    }

    fn status_at(&mut self, revision: &str, order: &dyn RevisionOrder) -> (Status, Option<u64>) {
        loop {
            let Some(&Some(top)) = self.seen.last() else {
                break;
            };
            if order.cmp(revision, &top.revision) != Ordering::Less {
                break;
            }
            let next = self.pending.next();
            self.seen.push(next);
        }

        let top = self.seen.last().copied().flatten();
        if let Some(entry) = top {
            if order.cmp(revision, &entry.revision) == Ordering::Equal {
                return (entry.status, Some(entry.build_number));
            }
        }
        if self.seen.len() == 1 {
            // Newer than anything this builder has built.
            return (Status::Unknown, None);
        }
        let status = match top {
            None => Status::Unknown,
            Some(older) => {
                let newer = self.seen[self.seen.len() - 2].map(|e| e.status);
                match (older.status, newer) {
                    (Status::Unknown, _) => Status::Unknown,
                    (Status::Success, Some(Status::InProgress)) => Status::InProgress,
                    (Status::Success, Some(Status::Success)) => Status::Success,
                    // The gap before a failure will end up failed too.
                    _ => Status::Failure,
                }
            }
        };
        (status, None)
    }
}

/// The newest revision every builder is green at, if any. The whole sweep
/// is reported to `observer` even after the candidate is found.
pub fn find_candidate(
    history: &BuildHistory,
    revisions: &[String],
    order: &dyn RevisionOrder,
    observer: &mut dyn StatusObserver,
) -> Option<String> {
    let mut cursors = Vec::new();
    for (master, builders) in history {
        observer.master(master);
        for (builder, entries) in builders {
            observer.builder(builder);
            cursors.push(Cursor::new(master, builder, entries));
        }
    }

    let mut candidate = None;
    for revision in revisions.iter().rev() {
        observer.revision(revision);
        let mut good = true;
        for cursor in &mut cursors {
            let (status, build_number) = cursor.status_at(revision, order);
            observer.build(cursor.master, cursor.builder, status, build_number);
            if status != Status::Success {
                good = false;
            }
        }
        if good && candidate.is_none() {
            candidate = Some(revision.clone());
            observer.lkgr(revision);
        }
    }
    candidate
}

/// Whether an LKGR that is `lag` old and `rev_gap` revisions behind is
/// still acceptable. The allowed lag grows when few revisions landed, since
/// a quiet tree can go a long time without a new LKGR.
pub fn check_lag(lag: Duration, rev_gap: i64, allowed_lag_hours: i64, allowed_gap: i64) -> bool {
    if rev_gap == 0 {
        return true;
    }
    let lag_hours = lag.num_hours();
    if lag_hours == 0 {
        return true;
    }
    let rev_rate = rev_gap as f64 / lag_hours as f64;
    let max_lag_hours = (1.0 + (allowed_gap - rev_gap).max(0) as f64 / rev_rate.clamp(15.0, 30.0))
        * allowed_lag_hours as f64;
    info!(
        "LKGR is {} hours old (threshold: {:.2} hours)",
        lag_hours, max_lag_hours
    );
    (lag.num_seconds() as f64 / 3600.0) < max_lag_hours
}

/// What to do after a sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// A revision newer than the current LKGR is green everywhere.
    Advance(String),
    /// Nothing newer; the current LKGR trails the newest revision by `gap`.
    Behind { gap: i64 },
}

pub fn judge(
    current: &str,
    candidate: Option<&str>,
    revisions: &[String],
    order: &dyn RevisionOrder,
) -> Verdict {
    if let Some(candidate) = candidate {
        let newer = !order.check(current) || order.cmp(candidate, current) == Ordering::Greater;
        if newer {
            return Verdict::Advance(candidate.to_string());
        }
    }
    let gap = revisions
        .last()
        .and_then(|newest| order.gap(current, newest))
        .unwrap_or_else(|| {
            warn!("cannot tell how far behind {} is", current);
            0
        });
    Verdict::Behind { gap }
}

/// The status app endpoints that hold the LKGR.
pub struct RevisionsApp {
    client: Client,
    url: String,
}

impl RevisionsApp {
    pub fn new(client: Client, url: &str) -> RevisionsApp {
        RevisionsApp {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }

    pub fn lkgr(&self) -> Result<String, FetchError> {
        let url = format!("{}/lkgr", self.url);
        debug!("fetching <{}>...", url);
        let fetch_err = |source| FetchError::Http {
            url: url.clone(),
            source,
        };
        let body = self
            .client
            .get(&url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.text())
            .map_err(fetch_err)?;
        Ok(body.trim().to_string())
    }

    pub fn post(&self, revision: &str, password: &str) -> Result<(), NotificationError> {
        let url = format!("{}/revisions", self.url);
        info!("Posting {} to {}...", revision, url);
        let form = [("revision", revision), ("success", "1"), ("password", password)];
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .map_err(http_err(&url))?;
        check_response(&url, response)?;
        info!("Done!");
        Ok(())
    }
}

/// Fetches the full history of every required builder. Builders that fail
/// to load are logged and left out.
pub fn fetch_build_data(project: &Project, source: &dyn BuildSource, parallelism: usize) -> BuildData {
    let requests: Vec<(&str, &MasterSteps, &str)> = project
        .masters
        .iter()
        .flat_map(|(name, master)| {
            master
                .builders
                .keys()
                .map(move |builder| (name.as_str(), master, builder.as_str()))
        })
        .collect();

    let fetched = parallel_map(requests, parallelism, |(name, master, builder)| {
        match source.builder_history(&master.url, builder) {
            Ok(builds) => Some((name, builder, builds)),
            Err(e) => {
                warn!("could not fetch {} on {}: {}", builder, name, e);
                None
            }
        }
    });

    let mut data = BuildData::new();
    for name in project.masters.keys() {
        data.entry(name.clone()).or_default();
    }
    for (name, builder, builds) in fetched.into_iter().flatten() {
        data.entry(name.to_string())
            .or_default()
            .insert(builder.to_string(), builds);
    }
    data
}

/// Console view of a master restricted to the required builders.
pub fn console_url(master: &MasterSteps) -> String {
    let Some(mut url) = master_path(&master.url, &["console"]).and_then(|u| Url::parse(&u).ok())
    else {
        return format!("{}/console", master.url);
    };
    {
        let mut query = url.query_pairs_mut();
        for builder in master.builders.keys() {
            query.append_pair("builder", builder);
        }
    }
    url.to_string()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const HTML_HEADER: &str = r#"<html>
<head>
<style type="text/css">
table { border-collapse: collapse; }
th { font-size: xx-small; }
td, th { text-align: center; }
.header { border: 1px solid black; }
.revision { padding-left: 5px; padding-right: 5px; }
.revision { border-left: 1px solid black; border-right: 1px solid black; }
.success { background-color: #8d4; }
.failure { background-color: #e88; }
.inprogress { background-color: #fe1; }
.unknown { background-color: #ddd; }
.lkgr { background-color: #4af; }
</style>
</head>
<body><table>
"#;

struct HtmlRow {
    revision: String,
    cells: Vec<(Status, Option<String>)>,
    lkgr: bool,
}

/// Renders the sweep as a colored revision × builder matrix.
pub struct HtmlStatusGenerator {
    master_urls: BTreeMap<String, String>,
    /// `%s` is replaced by the revision.
    revision_link: Option<String>,
    masters: Vec<(String, Vec<String>)>,
    rows: Vec<HtmlRow>,
}

impl HtmlStatusGenerator {
    pub fn new(project: &Project, revision_link: Option<String>) -> HtmlStatusGenerator {
        HtmlStatusGenerator {
            master_urls: project
                .masters
                .iter()
                .map(|(name, master)| (name.clone(), master.url.clone()))
                .collect(),
            revision_link,
            masters: Vec::new(),
            rows: Vec::new(),
        }
    }

    fn master_url(&self, master: &str, segments: &[&str]) -> Option<String> {
        master_path(self.master_urls.get(master)?, segments)
    }

    pub fn generate(&self) -> String {
        let mut html = String::from(HTML_HEADER);

        html.push_str("<tr class=\"header\"><th></th>\n");
        for (master, builders) in &self.masters {
            let _ = write!(html, "  <th colspan=\"{}\" class=\"header\">", builders.len());
            match self.master_url(master, &[]) {
                Some(url) => {
                    let _ = write!(
                        html,
                        "<a href=\"{}\" target=\"_blank\">{}</a>",
                        escape_html(&url),
                        escape_html(master)
                    );
                }
                None => html.push_str(&escape_html(master)),
            }
            html.push_str("</th>\n");
        }
        html.push_str("</tr>\n");

        html.push_str("<tr class=\"header\"><th>revision</th>\n");
        for (master, builders) in &self.masters {
            for builder in builders {
                match self.master_url(master, &["builders", builder]) {
                    Some(url) => {
                        let _ = writeln!(
                            html,
                            "  <th><a href=\"{}\" target=\"_blank\">{}</a></th>",
                            escape_html(&url),
                            escape_html(builder)
                        );
                    }
                    None => {
                        let _ = writeln!(html, "  <th>{}</th>", escape_html(builder));
                    }
                }
            }
        }
        html.push_str("</tr>\n");

        for row in &self.rows {
            let class = if row.lkgr { "lkgr" } else { "revision" };
            let _ = write!(html, "<tr><td class=\"{}\">", class);
            match &self.revision_link {
                Some(link) => {
                    let _ = write!(
                        html,
                        "<a href=\"{}\" target=\"_blank\">{}</a>",
                        escape_html(&link.replace("%s", &row.revision)),
                        escape_html(&row.revision)
                    );
                }
                None => html.push_str(&escape_html(&row.revision)),
            }
            html.push_str("</td>\n");
            for (status, url) in &row.cells {
                let class = if row.lkgr && *status == Status::Success {
                    "lkgr"
                } else {
                    status.class()
                };
                let _ = write!(html, "  <td class=\"{}\">", class);
                if let Some(url) = url {
                    let _ = write!(html, "<a href=\"{}\" target=\"_blank\">X</a>", escape_html(url));
                }
                html.push_str("</td>\n");
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</table></body></html>\n");
        html
    }
}

impl StatusObserver for HtmlStatusGenerator {
    fn master(&mut self, master: &str) {
        self.masters.push((master.to_string(), Vec::new()));
    }

    fn builder(&mut self, builder: &str) {
        if let Some((_, builders)) = self.masters.last_mut() {
            builders.push(builder.to_string());
        }
    }

    fn revision(&mut self, revision: &str) {
        self.rows.push(HtmlRow {
            revision: revision.to_string(),
            cells: Vec::new(),
            lkgr: false,
        });
    }

    fn build(&mut self, master: &str, builder: &str, status: Status, build_number: Option<u64>) {
        let url = build_number.and_then(|n| {
            let number = n.to_string();
            self.master_url(master, &["builders", builder, "builds", &number])
        });
        if let Some(row) = self.rows.last_mut() {
            row.cells.push((status, url));
        }
    }

    fn lkgr(&mut self, _revision: &str) {
        if let Some(row) = self.rows.last_mut() {
            row.lkgr = true;
        }
    }
}
