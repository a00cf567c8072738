//! Decides, build by build, whether to close the tree and whom to tell.
//!
//! [`Gatekeeper::check_build`] is a pure function of a build and the resolved
//! config. [`Gatekeeper::evaluate`] adds the ledger: a section fires at most
//! once per build, and only for steps that were not already failing in the
//! previous build of the same builder. [`Gatekeeper::run`] drives a whole
//! scan batch and coalesces every tree-closing failure into one status
//! write.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::build_db::{BuildDb, BuildKey};
use crate::buildbot::{build_url, BuildRecord, BuildResult, MasterJson};
use crate::config::{GatekeeperConfig, GatekeeperSection};
use crate::errors::NotificationError;
use crate::notify::{
    dedupe_emails, Email, EmailPayload, EmailStep, Mailer, SheriffSource, TreeStatus,
};

/// Pseudo-step reported when only the build's own result says it failed.
pub const OVERALL_BUILD_STATUS: &str = "[overall build status]";

/// In an optional set, stands for every finished step.
const ANY_STEP: &str = "*";

#[derive(Clone, Debug)]
pub struct GatekeeperOptions {
    pub default_from_email: String,
    /// Appended to recipients given without a domain.
    pub email_domain: String,
    /// Only these domains are mailed; `None` mails anyone.
    pub filter_domains: Option<BTreeSet<String>>,
    /// Without this, status changes are only logged.
    pub set_status: bool,
    pub open_tree: bool,
    pub emoji: Vec<String>,
    pub track_revisions: bool,
    pub revision_properties: Vec<String>,
}

impl Default for GatekeeperOptions {
    fn default() -> GatekeeperOptions {
        GatekeeperOptions {
            default_from_email: "buildbot@chromium.org".to_string(),
            email_domain: "google.com".to_string(),
            filter_domains: Some(
                ["chromium.org", "google.com"]
                    .iter()
                    .map(|d| d.to_string())
                    .collect(),
            ),
            set_status: false,
            open_tree: false,
            emoji: Vec::new(),
            track_revisions: false,
            revision_properties: vec!["revision".to_string()],
        }
    }
}

/// One section's complaint about one build.
#[derive(Clone, Debug)]
pub struct SectionFailure<'c> {
    pub section_hash: &'c str,
    pub section: &'c GatekeeperSection,
    pub unsatisfied: BTreeSet<String>,
    /// Failing these only notifies the section's watchers, not the blamelist.
    pub forgiving: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub struct BuildCheck<'c> {
    pub failures: Vec<SectionFailure<'c>>,
    pub successful_steps: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub section_hash: String,
    pub unsatisfied: BTreeSet<String>,
    pub close_tree: bool,
    pub status_message: String,
    pub email: Email,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decision {
    pub close_tree: bool,
    pub notifications: Vec<Notification>,
}

impl Decision {
    pub fn recipients(&self) -> BTreeSet<String> {
        self.notifications
            .iter()
            .flat_map(|n| n.email.recipients.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }
}

pub struct Collaborators<'c> {
    pub status: &'c dyn TreeStatus,
    /// `None` when email is turned off.
    pub mailer: Option<&'c dyn Mailer>,
    pub sheriffs: &'c dyn SheriffSource,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub decisions: Vec<(BuildKey, Decision)>,
    /// The status message the tree was (or, without `set_status`, would have
    /// been) closed with.
    pub closed_with: Option<String>,
    pub opened_with: Option<String>,
    pub emails: Vec<Email>,
    pub errors: Vec<NotificationError>,
}

fn joined<'s, I: IntoIterator<Item = &'s String>>(steps: I) -> String {
    steps.into_iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Steps of `build` that fail `section`, and the steps it forgives.
fn check_section(
    build: &BuildRecord,
    section: &GatekeeperSection,
    finished: &BTreeSet<String>,
    successful: &BTreeSet<String>,
) -> (BTreeSet<String>, BTreeSet<String>) {
    let excluded = &section.excluded_steps;
    let forgiving = &section.forgiving_steps - excluded;
    let mut forgiving_optional = &section.forgiving_optional - excluded;
    let closing = &(&section.closing_steps | &forgiving) - excluded;
    let mut closing_optional = &(&section.closing_optional | &forgiving_optional) - excluded;

    if forgiving_optional.contains(ANY_STEP) {
        forgiving_optional = finished - excluded;
    }
    if closing_optional.contains(ANY_STEP) {
        closing_optional = finished - excluded;
    }

    let failed = finished - successful;
    let mut unsatisfied = &closing - successful;
    unsatisfied.extend(failed.intersection(&closing_optional).cloned());

    // Steps of a running build may simply not have happened yet.
    if !build.finished() {
        unsatisfied = &unsatisfied & finished;
    }

    if unsatisfied.is_empty()
        && section.respect_build_status
        && build.result == Some(BuildResult::Failure)
    {
        unsatisfied.insert(OVERALL_BUILD_STATUS.to_string());
    }

    (unsatisfied, &forgiving | &forgiving_optional)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fills `%(name)s` placeholders; `%%` is a literal percent sign.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"%\((\w+)\)s|%%").unwrap());
    re.replace_all(template, |caps: &Captures<'_>| match caps.get(1) {
        None => "%".to_string(),
        Some(name) => vars.get(name.as_str()).cloned().unwrap_or_else(|| {
            warn!("unknown template key {:?} in {:?}", name.as_str(), template);
            caps[0].to_string()
        }),
    })
    .into_owned()
}

fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str()?.trim().parse().ok())
}

/// Orders revision property values. An unknown previous value sorts first.
fn compare_revisions(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => Some(display_value(a).cmp(&display_value(b))),
        },
    }
}

pub struct Gatekeeper<'a> {
    config: &'a GatekeeperConfig,
    options: &'a GatekeeperOptions,
}

impl<'a> Gatekeeper<'a> {
    pub fn new(config: &'a GatekeeperConfig, options: &'a GatekeeperOptions) -> Gatekeeper<'a> {
        Gatekeeper { config, options }
    }

    /// Evaluates `build` against every section configured for its master.
    /// Sections are independent; each may complain on its own.
    pub fn check_build(&self, build: &BuildRecord) -> BuildCheck<'a> {
        let finished: BTreeSet<String> = build
            .steps
            .iter()
            .filter(|s| s.finished)
            .map(|s| s.name.clone())
            .collect();
        // Exceptions and retries are infrastructure trouble, not failures.
        let successful_steps: BTreeSet<String> = build
            .steps
            .iter()
            .filter(|s| s.finished && s.status != Some(BuildResult::Failure))
            .map(|s| s.name.clone())
            .collect();

        let mut failures = Vec::new();
        for master_section in self.config.sections(&build.master_url) {
            let Some(section) = master_section.builder_section(&build.builder_name) else {
                continue;
            };
            let (unsatisfied, forgiving) =
                check_section(build, section, &finished, &successful_steps);
            if !unsatisfied.is_empty() {
                failures.push(SectionFailure {
                    section_hash: master_section.hash(),
                    section,
                    unsatisfied,
                    forgiving,
                });
            }
        }
        BuildCheck {
            failures,
            successful_steps,
        }
    }

    /// Checks one build and records what fired in the ledger.
    ///
    /// The ledger is written before recipients are resolved, so a sheriff
    /// lookup failure surfaces as an error without un-recording the trigger.
    pub fn evaluate(
        &self,
        build: &BuildRecord,
        db: &mut BuildDb,
        sheriffs: &dyn SheriffSource,
    ) -> Result<Decision, NotificationError> {
        let check = self.check_build(build);
        self.decide(build, &check.failures, db, sheriffs)
    }

    fn decide(
        &self,
        build: &BuildRecord,
        failures: &[SectionFailure<'a>],
        db: &mut BuildDb,
        sheriffs: &dyn SheriffSource,
    ) -> Result<Decision, NotificationError> {
        let key = BuildKey::new(&build.master_url, &build.builder_name, build.build_number);
        let mut fired = Vec::new();

        debug!("{} ----", build.url());
        for failure in failures {
            debug!("  section hash: {}", failure.section_hash);
            let previous = key
                .previous()
                .and_then(|prev| db.get(&prev))
                .and_then(|entry| entry.triggered.get(failure.section_hash))
                .cloned()
                .unwrap_or_default();
            let already_fired = db
                .get(&key)
                .map_or(false, |entry| entry.triggered.contains_key(failure.section_hash));
            db.record_trigger(&key, failure.section_hash, &failure.unsatisfied);

            debug!("  previous failing steps: {}", joined(&previous));
            debug!("  current failing steps: {}", joined(&failure.unsatisfied));
            if already_fired {
                debug!("  section has already been triggered for this build, skipping...");
                continue;
            }
            let new_steps: BTreeSet<&String> = failure.unsatisfied.difference(&previous).collect();
            if new_steps.is_empty() {
                debug!("  no new steps failed since the previous build");
                continue;
            }
            debug!("  new failing steps: {}", joined(new_steps));
            debug!("  build complete: {}", build.finished());
            debug!("  set to close tree: {}", failure.section.close_tree);
            fired.push(failure);
        }
        debug!("----");

        let mut decision = Decision::default();
        for failure in fired {
            let recipients = self.recipients(build, failure, sheriffs)?;
            decision.notifications.push(Notification {
                section_hash: failure.section_hash.to_string(),
                unsatisfied: failure.unsatisfied.clone(),
                close_tree: failure.section.close_tree,
                status_message: self.status_message(build, failure),
                email: Email {
                    payload: self.email_payload(build, failure),
                    recipients,
                },
            });
        }
        decision.close_tree = decision.notifications.iter().any(|n| n.close_tree);
        Ok(decision)
    }

    fn recipients(
        &self,
        build: &BuildRecord,
        failure: &SectionFailure<'_>,
        sheriffs: &dyn SheriffSource,
    ) -> Result<BTreeSet<String>, NotificationError> {
        let mut watchers = failure.section.tree_notify.clone();
        if failure.unsatisfied.is_subset(&failure.forgiving) {
            debug!("  only forgiving steps failed, leaving out the blamelist");
        } else {
            watchers.extend(build.blamelist.iter().cloned());
        }
        for class in &failure.section.sheriff_classes {
            watchers.extend(sheriffs.sheriffs(class)?);
        }
        Ok(watchers
            .into_iter()
            .map(|who| self.qualify(who))
            .filter(|who| self.domain_allowed(who))
            .collect())
    }

    fn qualify(&self, who: String) -> String {
        if who.contains('@') {
            who
        } else {
            format!("{}@{}", who, self.options.email_domain)
        }
    }

    fn domain_allowed(&self, who: &str) -> bool {
        match &self.options.filter_domains {
            None => true,
            Some(domains) => who
                .rsplit('@')
                .next()
                .map_or(false, |domain| domains.contains(domain)),
        }
    }

    fn template_vars(&self, build: &BuildRecord, failure: &SectionFailure<'_>) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("blamelist".to_string(), build.blamelist.join(","));
        vars.insert("build_url".to_string(), build.url());
        vars.insert("builder_name".to_string(), build.builder_name.clone());
        vars.insert("project_name".to_string(), build.project_name.clone());
        vars.insert("unsatisfied".to_string(), joined(&failure.unsatisfied));
        for property in &self.options.revision_properties {
            let value = build
                .property(property)
                .map(display_value)
                .unwrap_or_else(|| "None".to_string());
            vars.insert(property.clone(), value);
        }
        vars
    }

    fn status_message(&self, build: &BuildRecord, failure: &SectionFailure<'_>) -> String {
        render_template(
            &failure.section.status_template,
            &self.template_vars(build, failure),
        )
    }

    fn email_payload(&self, build: &BuildRecord, failure: &SectionFailure<'_>) -> EmailPayload {
        let steps = build
            .steps
            .iter()
            .map(|step| EmailStep {
                name: step.name.clone(),
                text: step.text.clone(),
                logs: step.logs.clone(),
                urls: if step.urls.is_null() {
                    Value::Array(Vec::new())
                } else {
                    step.urls.clone()
                },
                started: step.started,
                results: step.results.first().cloned().unwrap_or(Value::from(0)),
            })
            .collect();
        EmailPayload {
            build_url: build.url(),
            from_addr: build
                .from_addr
                .clone()
                .unwrap_or_else(|| self.options.default_from_email.clone()),
            project_name: build.project_name.clone(),
            subject_template: failure.section.subject_template.clone(),
            steps,
            unsatisfied: failure.unsatisfied.iter().cloned().collect(),
            waterfall_url: build.master_url.trim_end_matches('/').to_string(),
            builder_name: build.builder_name.clone(),
            number: build.build_number,
            reason: build.reason.clone(),
            // A running build has no result yet; it can only be here by failing.
            result: build
                .result
                .unwrap_or_else(|| BuildResult::Failure.combine(build.combined_step_result()))
                .code(),
            blamelist: build.blamelist.clone(),
            changes: build.changes.clone(),
            revisions: build
                .changes
                .iter()
                .map(|c| c.revision.clone().unwrap_or(Value::Null))
                .collect(),
        }
    }

    /// Processes one scan batch: evaluates every build, then closes the tree
    /// at most once and sends the deduplicated emails.
    pub fn run(
        &self,
        builds: &[BuildRecord],
        masters: &BTreeMap<String, MasterJson>,
        db: &mut BuildDb,
        collaborators: &Collaborators<'_>,
    ) -> ScanReport {
        let mut report = ScanReport::default();

        // Newest first, so a failure can be matched against later successes.
        let mut sorted: Vec<&BuildRecord> = builds.iter().collect();
        sorted.sort_by(|a, b| b.build_number.cmp(&a.build_number));

        let mut resolved_steps: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        let mut current_builds_successful = true;
        let mut failing = Vec::new();
        for build in sorted {
            let check = self.check_build(build);
            let resolved = resolved_steps
                .entry((build.master_url.clone(), build.builder_name.clone()))
                .or_default();
            resolved.extend(check.successful_steps.iter().cloned());
            for failure in &check.failures {
                let still_failing: Vec<&String> =
                    failure.unsatisfied.difference(resolved).collect();
                if !still_failing.is_empty() && failure.section.close_tree {
                    debug!(
                        "{} failed on {}, not yet resolved.",
                        joined(still_failing),
                        build.url()
                    );
                    current_builds_successful = false;
                }
            }

            let key = BuildKey::new(&build.master_url, &build.builder_name, build.build_number);
            let entry = db.update(&key);
            if entry.finished {
                entry.succeeded = check.failures.is_empty();
            }
            if !check.failures.is_empty() {
                failing.push((build, check.failures));
            }
        }
        failing.reverse();

        if self.options.open_tree {
            match self.open_tree_if_possible(
                masters,
                db,
                &resolved_steps,
                current_builds_successful,
                collaborators.status,
            ) {
                Ok(message) => report.opened_with = message,
                Err(e) => {
                    warn!("could not open the tree: {}", e);
                    report.errors.push(e);
                }
            }
        }

        if !failing.is_empty() && current_builds_successful {
            debug!("All failing steps succeeded in later runs, not closing tree.");
            return report;
        }

        let mut kept = Vec::new();
        for (build, failures) in failing {
            match self.decide(build, &failures, db, collaborators.sheriffs) {
                Ok(decision) if decision.is_empty() => {}
                Ok(decision) => kept.push((build, decision)),
                Err(e) => {
                    warn!("could not notify about {}: {}", build.url(), e);
                    report.errors.push(e);
                }
            }
        }

        if self.options.track_revisions {
            kept = self.reject_old_revisions(kept, db);
        }

        match self.close_tree_if_necessary(&kept, collaborators.status) {
            Ok(message) => report.closed_with = message,
            Err(e) => {
                warn!("could not close the tree: {}", e);
                report.errors.push(e);
            }
        }

        report.emails = self.send_emails(&kept, collaborators.mailer, &mut report.errors);
        report.decisions = kept
            .into_iter()
            .map(|(build, decision)| {
                let key = BuildKey::new(&build.master_url, &build.builder_name, build.build_number);
                (key, decision)
            })
            .collect();
        report
    }

    fn close_tree_if_necessary(
        &self,
        kept: &[(&BuildRecord, Decision)],
        status: &dyn TreeStatus,
    ) -> Result<Option<String>, NotificationError> {
        let closing = kept
            .iter()
            .flat_map(|(_, decision)| decision.notifications.iter())
            .find(|n| n.close_tree);
        let Some(closing) = closing else {
            info!("no tree-closing failures!");
            return Ok(None);
        };

        let state = status.current()?;
        if !state.is_open() {
            debug!("tree is {}, leaving it alone", state.general_state);
            return Ok(None);
        }

        info!(
            "{} failed builds found, closing the tree...",
            kept.iter().filter(|(_, d)| d.close_tree).count()
        );
        info!("closing the tree with message: '{}'", closing.status_message);
        if self.options.set_status {
            status.set(&closing.status_message)?;
        } else {
            info!("set-status not set, not connecting to the status app!");
        }
        Ok(Some(closing.status_message.clone()))
    }

    fn open_tree_if_possible(
        &self,
        masters: &BTreeMap<String, MasterJson>,
        db: &BuildDb,
        resolved_steps: &BTreeMap<(String, String), BTreeSet<String>>,
        current_builds_successful: bool,
        status: &dyn TreeStatus,
    ) -> Result<Option<String>, NotificationError> {
        if !current_builds_successful {
            debug!("Not opening tree because failing steps were detected.");
            return Ok(None);
        }

        let none = BTreeSet::new();
        let mut previously_failed = Vec::new();
        for (master_url, master) in masters {
            for builder in master.builders.keys() {
                let Some(builds) = db.builds(master_url, builder) else {
                    continue;
                };
                let resolved = resolved_steps
                    .get(&(master_url.clone(), builder.clone()))
                    .unwrap_or(&none);
                for (number, entry) in builds {
                    if !entry.finished || entry.succeeded {
                        continue;
                    }
                    let still_failing: BTreeSet<&String> = entry
                        .triggered
                        .values()
                        .flatten()
                        .filter(|step| !resolved.contains(*step))
                        .collect();
                    if !still_failing.is_empty() {
                        previously_failed.push(format!(
                            "{} on {}",
                            joined(still_failing),
                            build_url(master_url, builder, *number)
                        ));
                    }
                }
            }
        }
        if !previously_failed.is_empty() {
            debug!("Not opening tree because previous builds weren't successful:");
            for build in &previously_failed {
                debug!("  {}", build);
            }
            return Ok(None);
        }

        let state = status.current()?;
        if !state.is_closed() {
            return Ok(None);
        }
        static AUTOMATIC: OnceLock<Regex> = OnceLock::new();
        let automatic = AUTOMATIC.get_or_init(|| Regex::new(r"(?i)automatic").unwrap());
        if !automatic.is_match(&state.message) {
            debug!("not overriding a manual closure: {:?}", state.message);
            return Ok(None);
        }

        info!("All builders are green, opening the tree...");
        let message = match self.options.emoji.choose(&mut rand::thread_rng()) {
            Some(emoji) => {
                let mut emoji = emoji.clone();
                if emoji.ends_with(')') {
                    emoji.push(' ');
                }
                format!("Tree is open (Automatic: {})", emoji)
            }
            None => "Tree is open (Automatic)".to_string(),
        };
        info!("Opening tree with message: '{}'", message);
        if self.options.set_status {
            status.set(&message)?;
        } else {
            info!("set-status not set, not connecting to the status app!");
        }
        Ok(Some(message))
    }

    /// Drops failures on revisions no newer than the last one that fired.
    /// Newer means every tracked property is at least as large and one is
    /// strictly larger.
    fn reject_old_revisions<'b>(
        &self,
        mut kept: Vec<(&'b BuildRecord, Decision)>,
        db: &mut BuildDb,
    ) -> Vec<(&'b BuildRecord, Decision)> {
        let properties: BTreeSet<&String> = self.options.revision_properties.iter().collect();
        let mut triggered = db.aux.triggered_revisions.clone();
        if triggered.keys().collect::<BTreeSet<_>>() != properties {
            info!(
                "revision properties have changed from {:?} to {:?}, clearing previous data.",
                triggered.keys().collect::<Vec<_>>(),
                properties
            );
            triggered = properties
                .iter()
                .map(|p| ((*p).clone(), Value::Null))
                .collect();
        }

        // Latest start first approximates newest revision first.
        kept.sort_by(|(a, _), (b, _)| {
            b.start_time
                .partial_cmp(&a.start_time)
                .unwrap_or(Ordering::Equal)
        });

        let mut result = Vec::new();
        for (build, decision) in kept {
            let revisions: BTreeMap<String, Value> = properties
                .iter()
                .map(|p| ((*p).clone(), build.property(p).cloned().unwrap_or(Value::Null)))
                .collect();
            debug!("previous revision information: {:?}", triggered);
            debug!("current revision information: {:?}", revisions);

            if revisions.values().any(Value::is_null) {
                debug!("revisions missing from {}, keeping build", build.url());
                triggered = revisions;
                result.push((build, decision));
                continue;
            }

            let orders: Vec<Option<Ordering>> = revisions
                .iter()
                .map(|(p, current)| {
                    let previous = triggered.get(p).unwrap_or(&Value::Null);
                    compare_revisions(previous, current)
                })
                .collect();
            let all_newer_or_same = orders
                .iter()
                .all(|o| matches!(o, Some(Ordering::Less) | Some(Ordering::Equal)));
            let any_newer = orders.iter().any(|o| *o == Some(Ordering::Less));
            if all_newer_or_same && any_newer {
                debug!("keeping {}", build.url());
                triggered = revisions;
                result.push((build, decision));
            } else {
                debug!("rejecting {}", build.url());
            }
        }
        db.aux.triggered_revisions = triggered;
        result
    }

    fn send_emails(
        &self,
        kept: &[(&BuildRecord, Decision)],
        mailer: Option<&dyn Mailer>,
        errors: &mut Vec<NotificationError>,
    ) -> Vec<Email> {
        let mut emails = Vec::new();
        for (build, decision) in kept {
            for notification in &decision.notifications {
                info!(
                    "to {}: failure in {} build {}: {}",
                    joined(&notification.email.recipients),
                    build.builder_name,
                    build.build_number,
                    joined(&notification.unsatisfied)
                );
                if !notification.email.recipients.is_empty() {
                    emails.push(notification.email.clone());
                }
            }
        }
        let emails = dedupe_emails(emails);

        match mailer {
            None if !emails.is_empty() => warn!("no email app specified, no email sent!"),
            None => {}
            Some(mailer) => {
                for email in &emails {
                    if let Err(e) = mailer.send(email) {
                        warn!("could not send email for {}: {}", email.payload.build_url, e);
                        errors.push(e);
                    }
                }
            }
        }
        emails
    }
}
