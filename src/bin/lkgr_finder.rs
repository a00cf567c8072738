// Copyright 2018 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use chrono::Utc;
use clap::{ArgAction, Parser};
use colored::Colorize;
use log::{info, warn};

use buildbot_gatekeeper::build_scan::DEFAULT_PARALLELISM;
use buildbot_gatekeeper::errors::{ExitStatusError, NotificationError};
use buildbot_gatekeeper::http::{self, BuildbotClient, DEFAULT_TIMEOUT};
use buildbot_gatekeeper::lkgr::{
    check_lag, collate_revision_history, console_url, fetch_build_data, find_candidate, judge,
    BuildData, HtmlStatusGenerator, NullObserver, RevisionsApp, StatusObserver, Verdict,
    DEFAULT_ALLOWED_GAP, DEFAULT_ALLOWED_LAG_HOURS,
};
use buildbot_gatekeeper::lkgr_config::LkgrConfig;
use buildbot_gatekeeper::lkgr_notify::{LkgrAnnouncer, LocalNotifier, DEFAULT_ERROR_RECIPIENTS};
use buildbot_gatekeeper::revision::{GitOrder, RevisionOrder, SvnOrder};

#[derive(Debug, Parser)]
#[command(
    bin_name = "lkgr-finder",
    version,
    about = "Finds the last known good revision of a project.",
    after_help = "EXAMPLES:
    See what the next LKGR would be, without changing anything:

        lkgr-finder --config lkgr.toml --project chromium -n

    Advance the LKGR and record it:

        lkgr-finder --post --write-to-file LKGR"
)]
struct Opts {
    #[arg(short, long, help = "Only print warnings and errors")]
    quiet: bool,

    #[arg(short = 'n', long, help = "Don't actually upload the new LKGR")]
    dry_run: bool,

    #[arg(long, help = "Upload the new LKGR to the status app")]
    post: bool,

    #[arg(long, value_name = "FILE", help = "Write the new LKGR to FILE")]
    write_to_file: Option<PathBuf>,

    #[arg(
        long,
        default_value = ".status_password",
        value_name = "FILE",
        help = "File containing the password for the status app"
    )]
    password_file: PathBuf,

    #[arg(
        long,
        value_name = "HOST:PORT",
        help = "Notify this master when a new LKGR is found; may be repeated"
    )]
    notify: Vec<String>,

    #[arg(long, help = "Send email to the error recipients on errors (for cron)")]
    email_errors: bool,

    #[arg(
        long,
        default_value = DEFAULT_ERROR_RECIPIENTS,
        value_delimiter = ',',
        help = "Comma-separated recipients of error email"
    )]
    error_recipients: Vec<String>,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Comma-separated recipients of email when the LKGR is updated"
    )]
    update_recipients: Vec<String>,

    #[arg(long, value_name = "ADDRESS", help = "Send email from ADDRESS [default: $LOGNAME@<host>]")]
    email_from: Option<String>,

    #[arg(long, value_name = "REV", help = "Set the LKGR manually")]
    manual: Option<String>,

    #[arg(
        long,
        value_name = "REV",
        help = "Use REV as the current LKGR instead of asking the status app"
    )]
    current_lkgr: Option<String>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Read build data from FILE rather than the masters; - reads stdin"
    )]
    build_data: Option<String>,

    #[arg(long, value_name = "FILE", help = "Dump the raw build data as JSON")]
    dump_build_data: Option<PathBuf>,

    #[arg(
        long,
        default_value_t = DEFAULT_ALLOWED_GAP,
        help = "How many revisions LKGR may trail head before it is out of date"
    )]
    allowed_gap: i64,

    #[arg(
        long,
        default_value_t = DEFAULT_ALLOWED_LAG_HOURS,
        help = "How many hours LKGR may go without an update; grows when commits slow down"
    )]
    allowed_lag: i64,

    #[arg(long, value_name = "FILE", help = "Write the sweep as an HTML table")]
    html: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        help = "Link revisions in the HTML table, %s is replaced by the revision"
    )]
    revision_link: Option<String>,

    #[arg(long, default_value = "lkgr.toml", help = "Location of the LKGR config")]
    config: PathBuf,

    #[arg(long, default_value = "chromium", help = "Project to find the LKGR of")]
    project: String,

    #[arg(long, value_name = "PATH", help = "Order revisions as commits of this git checkout")]
    git_repo: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_PARALLELISM, help = "Up to this many builders are fetched at once")]
    parallelism: usize,

    #[arg(short, long, action = ArgAction::Count, help = "Turn on extra debugging information")]
    verbose: u8,
}

impl Opts {
    fn announcer<'a>(&self, notifier: &'a LocalNotifier) -> LkgrAnnouncer<'a> {
        LkgrAnnouncer {
            notifier,
            project: self.project.clone(),
            sender: self.email_from.clone().unwrap_or_else(default_sender),
            masters: self.notify.clone(),
            error_recipients: if self.email_errors {
                Some(self.error_recipients.clone())
            } else {
                None
            },
            update_recipients: self.update_recipients.clone(),
            dry_run: self.dry_run,
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.verbose > 0 {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

fn default_sender() -> String {
    let user = std::env::var("LOGNAME").unwrap_or_else(|_| "unknown".to_string());
    let host = fs::read_to_string("/etc/hostname")
        .map(|h| h.trim().to_string())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

/// Everything said on stderr during a run, for error email.
#[derive(Default)]
struct RunLog(Vec<String>);

impl RunLog {
    fn record(&mut self, line: String) {
        self.0.push(format!("{}: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), line));
    }

    fn say(&mut self, line: String) {
        eprintln!("{}", line);
        self.record(line);
    }

    fn alarm(&mut self, line: String) {
        eprintln!("{}", line.red());
        self.record(line);
    }
}

fn warn_undelivered<I: IntoIterator<Item = NotificationError>>(errors: I) {
    for e in errors {
        warn!("{}", e);
    }
}

fn read_build_data(path: &str) -> anyhow::Result<BuildData> {
    let contents = if path == "-" {
        let mut contents = String::new();
        io::stdin().read_to_string(&mut contents)?;
        contents
    } else {
        fs::read_to_string(path).with_context(|| format!("could not read {}", path))?
    };
    serde_json::from_str(&contents).with_context(|| format!("malformed build data in {}", path))
}

fn dump_build_data(path: &Path, data: &BuildData) {
    let dumped = serde_json::to_string_pretty(data)
        .map_err(anyhow::Error::from)
        .and_then(|json| Ok(fs::write(path, json)?));
    if let Err(e) = dumped {
        warn!("Could not dump to {}: {}", path.display(), e);
    }
}

fn post_lkgr(app: &RevisionsApp, revision: &str, opts: &Opts) -> anyhow::Result<()> {
    if opts.dry_run {
        info!("Would post {} (dry run)", revision);
        return Ok(());
    }
    let password = fs::read_to_string(&opts.password_file)
        .with_context(|| format!("could not read {}", opts.password_file.display()))?;
    app.post(revision, password.trim())?;
    Ok(())
}

fn run() -> anyhow::Result<()> {
    let opts = Opts::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(opts.log_filter()))
        .init();

    let config = LkgrConfig::load(&opts.config)?;
    let project = config.project(&opts.project)?;
    let app = RevisionsApp::new(http::client(DEFAULT_TIMEOUT)?, &project.revisions_url);
    let notifier = LocalNotifier::default();
    let announcer = opts.announcer(&notifier);
    let mut run_log = RunLog::default();

    if let Some(revision) = &opts.manual {
        post_lkgr(&app, revision, &opts)?;
        let mut undelivered = announcer.notify_masters(revision);
        undelivered.extend(announcer.announce_update(revision, true).err());
        warn_undelivered(undelivered);
        return Ok(());
    }

    let lkgr = match &opts.current_lkgr {
        Some(lkgr) => lkgr.clone(),
        None => match app.lkgr() {
            Ok(lkgr) => lkgr,
            Err(e) => {
                run_log.record(format!("Could not fetch {} LKGR: {}", opts.project, e));
                let problem = format!("Failed to fetch {} LKGR", opts.project);
                warn_undelivered(announcer.report_error(&problem, &run_log.0).err());
                return Err(e.into());
            }
        },
    };

    let data = match &opts.build_data {
        Some(path) => read_build_data(path)?,
        None => fetch_build_data(project, &BuildbotClient::new()?, opts.parallelism),
    };
    if let Some(path) = &opts.dump_build_data {
        dump_build_data(path, &data);
    }

    let order: Box<dyn RevisionOrder> = match &opts.git_repo {
        Some(path) => Box::new(GitOrder::open(path)?),
        None => Box::new(SvnOrder::new(project.svn_url.clone())),
    };

    let (history, revisions) = collate_revision_history(&data, &project.masters, order.as_ref());
    let mut html = opts
        .html
        .as_ref()
        .map(|_| HtmlStatusGenerator::new(project, opts.revision_link.clone()));
    let mut null = NullObserver;
    let candidate = {
        let observer: &mut dyn StatusObserver = match html.as_mut() {
            Some(html) => html,
            None => &mut null,
        };
        find_candidate(&history, &revisions, order.as_ref(), observer)
    };
    if let (Some(path), Some(html)) = (&opts.html, &html) {
        fs::write(path, html.generate())
            .with_context(|| format!("could not write {}", path.display()))?;
    }

    info!("{}", "-".repeat(52));
    info!("Current {} LKGR is {}", opts.project, lkgr);
    info!("{}", "-".repeat(52));
    run_log.record(format!("Current {} LKGR is {}", opts.project, lkgr));

    match judge(&lkgr, candidate.as_deref(), &revisions, order.as_ref()) {
        Verdict::Advance(candidate) => {
            eprintln!(
                "Candidate {} LKGR is {}",
                opts.project,
                candidate.green().bold()
            );
            for (name, master) in &project.masters {
                eprintln!("{} console: {}", name, console_url(master));
            }
            let mut undelivered = Vec::new();
            if opts.post {
                post_lkgr(&app, &candidate, &opts)?;
                undelivered.extend(announcer.announce_update(&candidate, false).err());
            }
            if let (Some(path), false) = (&opts.write_to_file, opts.dry_run) {
                fs::write(path, &candidate)
                    .with_context(|| format!("could not write {}", path.display()))?;
            }
            undelivered.extend(announcer.notify_masters(&candidate));
            warn_undelivered(undelivered);
            Ok(())
        }
        Verdict::Behind { gap } => {
            run_log.say(format!(
                "No newer {} LKGR found than current {}",
                opts.project, lkgr
            ));
            run_log.say(format!("{} LKGR is behind by {} revisions", opts.project, gap));
            if gap > opts.allowed_gap {
                let problem = format!(
                    "{} LKGR ({}) > {} revisions behind",
                    opts.project, lkgr, opts.allowed_gap
                );
                run_log.alarm(problem.clone());
                warn_undelivered(announcer.report_error(&problem, &run_log.0).err());
                return Err(ExitStatusError(1).into());
            }

            let age = order
                .commit_time(&lkgr)
                .map(|committed| Utc::now() - committed)
                .unwrap_or_else(chrono::Duration::zero);
            if !check_lag(age, gap, opts.allowed_lag, opts.allowed_gap) {
                let problem = format!("{} LKGR ({}) exceeds lag threshold", opts.project, lkgr);
                run_log.alarm(problem.clone());
                warn_undelivered(announcer.report_error(&problem, &run_log.0).err());
                return Err(ExitStatusError(1).into());
            }
            Ok(())
        }
    }
}

fn main() {
    if let Err(err) = run() {
        match err.downcast::<ExitStatusError>() {
            Ok(ExitStatusError(code)) => process::exit(code),
            Err(err) => {
                eprintln!("Error: {}", err);
                process::exit(1);
            }
        }
    }
}
