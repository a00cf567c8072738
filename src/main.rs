// Copyright 2018 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use colored::Colorize;
use dialoguer::Password;
use log::{info, warn};

use buildbot_gatekeeper::build_db::{BuildDb, BuildDbLock};
use buildbot_gatekeeper::build_scan::{get_updated_builds, DEFAULT_PARALLELISM};
use buildbot_gatekeeper::config::GatekeeperConfig;
use buildbot_gatekeeper::errors::ExitStatusError;
use buildbot_gatekeeper::gatekeeper::{Collaborators, Gatekeeper, GatekeeperOptions};
use buildbot_gatekeeper::http::{self, BuildbotClient, DEFAULT_TIMEOUT};
use buildbot_gatekeeper::notify::{
    Mailer, MailerApp, SheriffRota, StatusApp, DEFAULT_EMAIL_APP_URL, DEFAULT_SHERIFF_URL,
    DEFAULT_STATUS_URL,
};

#[derive(Debug, Parser)]
#[command(
    bin_name = "gatekeeper",
    version,
    about = "Closes the tree if annotated builds fail.",
    after_help = "EXAMPLES:
    Check the config file:

        gatekeeper --json gatekeeper.json --verify

    Scan a master, logging what would be done:

        gatekeeper --json gatekeeper.json http://build.chromium.org/p/chromium

    Scan and actually close the tree:

        gatekeeper --set-status --open-tree http://build.chromium.org/p/chromium"
)]
struct Opts {
    #[arg(
        help = "Master URLs to scan",
        required_unless_present_any = ["verify", "flatten_json"]
    )]
    masters: Vec<String>,

    #[arg(long, default_value = "build_db.json", help = "Records the last-seen build for each builder")]
    build_db: PathBuf,

    #[arg(long, help = "Reset the build db to be empty")]
    clear_build_db: bool,

    #[arg(long, help = "Don't process any builds, but update the build db to the latest build numbers")]
    sync_build_db: bool,

    #[arg(long, help = "Don't write to the build db")]
    skip_build_db_update: bool,

    #[arg(long, default_value = ".status_password", help = "Password file for the status app")]
    password_file: PathBuf,

    #[arg(short, long, help = "Close the tree by connecting to the status app")]
    set_status: bool,

    #[arg(long, help = "Open the tree by connecting to the status app")]
    open_tree: bool,

    #[arg(long, default_value = DEFAULT_STATUS_URL, help = "URL for root of the status app")]
    status_url: String,

    #[arg(long, help = "Only close on increasing revisions")]
    track_revisions: bool,

    #[arg(
        long,
        default_values = ["revision"],
        value_delimiter = ',',
        help = "Comma-separated build properties to compare revisions on"
    )]
    revision_properties: Vec<String>,

    #[arg(long, default_value = "buildbot@chromium.org", help = "Username for the status app")]
    status_user: String,

    #[arg(long, help = "Allow emailing any domain")]
    disable_domain_filter: bool,

    #[arg(
        long,
        default_values = ["chromium.org", "google.com"],
        value_delimiter = ',',
        help = "Only email users in these comma-separated domains"
    )]
    filter_domain: Vec<String>,

    #[arg(long, default_value = "google.com", help = "Email domain added to users without one")]
    email_domain: String,

    #[arg(long, default_value = DEFAULT_SHERIFF_URL, help = "URL pattern for the current sheriff list")]
    sheriff_url: String,

    #[arg(long, default_value_t = DEFAULT_PARALLELISM, help = "Up to this many builds are fetched at once")]
    parallelism: usize,

    #[arg(long, default_value = "buildbot@chromium.org", help = "Default address to send email from")]
    default_from_email: String,

    #[arg(long, default_value = DEFAULT_EMAIL_APP_URL, help = "URL of the application to send email from")]
    email_app_url: String,

    #[arg(long, default_value = ".gatekeeper_secret", help = "File containing the email app secret")]
    email_app_secret_file: PathBuf,

    #[arg(long, help = "Don't send emails")]
    no_email_app: bool,

    #[arg(long, default_value = "gatekeeper.json", help = "Location of the gatekeeper config")]
    json: PathBuf,

    #[arg(
        long,
        default_value = "gatekeeper_emoji.json",
        help = "Emoji for opening the tree, or None to turn them off"
    )]
    emoji: String,

    #[arg(long, help = "Verify that the gatekeeper config is correct")]
    verify: bool,

    #[arg(long, help = "Display the flattened gatekeeper config")]
    flatten_json: bool,

    #[arg(long, requires = "flatten_json", help = "Don't insert section hashes")]
    no_hashes: bool,

    #[arg(short, long, action = ArgAction::Count, help = "Turn on extra debugging information")]
    verbose: u8,
}

impl Opts {
    fn gatekeeper_options(&self, emoji: Vec<String>) -> GatekeeperOptions {
        GatekeeperOptions {
            default_from_email: self.default_from_email.clone(),
            email_domain: self.email_domain.clone(),
            filter_domains: if self.disable_domain_filter {
                None
            } else {
                Some(self.filter_domain.iter().cloned().collect::<BTreeSet<_>>())
            },
            set_status: self.set_status,
            open_tree: self.open_tree,
            emoji,
            track_revisions: self.track_revisions,
            revision_properties: self.revision_properties.clone(),
        }
    }
}

fn read_secret(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn status_password(path: &Path) -> anyhow::Result<String> {
    match read_secret(path) {
        Ok(password) => Ok(password),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            eprintln!("{} not found", path.display());
            Ok(Password::new()
                .with_prompt("Status app password")
                .interact()?)
        }
        Err(e) => Err(e).with_context(|| format!("could not read {}", path.display())),
    }
}

fn load_emoji(path: &str) -> Vec<String> {
    if path == "None" {
        return Vec::new();
    }
    let loaded = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|contents| Ok(serde_json::from_str(&contents)?));
    match loaded {
        Ok(emoji) => emoji,
        Err(e) => {
            warn!("Could not load emoji file {}: {}", path, e);
            Vec::new()
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = Opts::parse();

    let default_filter = if args.verbose > 0 { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = GatekeeperConfig::load(&args.json)?;

    if args.verify {
        eprintln!("{} is valid", args.json.display());
        return Ok(());
    }

    if args.flatten_json {
        let flattened = config.flatten(!args.no_hashes);
        println!("{}", serde_json::to_string_pretty(&flattened)?);
        return Ok(());
    }

    let masters: Vec<String> = args
        .masters
        .iter()
        .map(|m| m.trim_end_matches('/').to_string())
        .collect();
    config.check_masters(&masters)?;

    let mailer_secret = if args.no_email_app {
        None
    } else {
        match read_secret(&args.email_app_secret_file) {
            Ok(secret) => Some(secret),
            Err(_) => {
                eprintln!(
                    "error: must provide email app auth with {}",
                    args.email_app_secret_file.display()
                );
                return Err(ExitStatusError(2).into());
            }
        }
    };

    let password = if args.set_status {
        Some(status_password(&args.password_file)?)
    } else {
        None
    };

    let emoji = load_emoji(&args.emoji);

    let _lock = BuildDbLock::acquire(&args.build_db)?;
    let mut db = if args.clear_build_db {
        let mut db = BuildDb::new();
        db.save(&args.build_db)?;
        db
    } else {
        BuildDb::load(&args.build_db)?
    };

    let source = BuildbotClient::new()?;
    let scan = get_updated_builds(&masters, &mut db, &source, args.parallelism);
    info!("{} new or running builds", scan.builds.len());

    if args.sync_build_db {
        config.record_sections(&mut db);
        db.save(&args.build_db)?;
        return Ok(());
    }

    let client = http::client(DEFAULT_TIMEOUT)?;
    let status = StatusApp::new(client.clone(), &args.status_url, &args.status_user, password);
    let sheriffs = SheriffRota::new(client.clone(), &args.sheriff_url);
    let mailer =
        mailer_secret.map(|secret| MailerApp::new(client, &args.email_app_url, secret.into_bytes()));

    let options = args.gatekeeper_options(emoji);
    let gatekeeper = Gatekeeper::new(&config, &options);
    let collaborators = Collaborators {
        status: &status,
        mailer: mailer.as_ref().map(|m| m as &dyn Mailer),
        sheriffs: &sheriffs,
    };
    let report = gatekeeper.run(&scan.builds, &scan.masters, &mut db, &collaborators);

    if let Some(message) = &report.closed_with {
        eprintln!("{} {}", "closing tree:".red().bold(), message);
    }
    if let Some(message) = &report.opened_with {
        eprintln!("{} {}", "opening tree:".green().bold(), message);
    }
    for email in &report.emails {
        let recipients: Vec<&str> = email.recipients.iter().map(String::as_str).collect();
        eprintln!(
            "notified {} about {}",
            recipients.join(", ").yellow(),
            email.payload.build_url
        );
    }

    if !args.skip_build_db_update {
        config.record_sections(&mut db);
        db.save(&args.build_db)?;
    }

    if !report.errors.is_empty() {
        bail!("{} notifications could not be delivered", report.errors.len());
    }
    Ok(())
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
