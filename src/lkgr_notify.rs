//! Telling masters and people about the LKGR.
//!
//! When the LKGR moves, masters given with `--notify` get a change for the
//! new revision and `--update-recipients` get a short email. When the LKGR
//! is stale, `--error-recipients` get the run log, but only with
//! `--email-errors`.

use std::io::Write;
use std::process::{Command, Stdio};

use log::{info, warn};

use crate::errors::NotificationError;

/// Seconds a master gets to accept a change before we give up on it.
pub const SENDCHANGE_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_ERROR_RECIPIENTS: &str = "chrome-troopers+alerts@google.com";

const SUBJECT_PREFIX: &str = "lkgr-finder: ";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Mail {
    /// Headers and body as handed to the local MTA. Replies go to the
    /// recipients, not to whatever account the finder runs as.
    pub fn to_message(&self) -> String {
        let to = self.to.join(",");
        format!(
            "From: {}\nTo: {}\nSubject: {}\nReply-To: {}\n\n{}\n",
            self.from, to, self.subject, to, self.body
        )
    }
}

pub trait LkgrNotifier {
    /// Sends a change for `revision` to the master listening at `master`
    /// (`host:port`).
    fn notify_master(&self, master: &str, revision: &str) -> Result<(), NotificationError>;
    fn send_mail(&self, mail: &Mail) -> Result<(), NotificationError>;
}

/// Delivers through `buildbot sendchange` and the local `sendmail`.
#[derive(Clone, Debug)]
pub struct LocalNotifier {
    pub sendchange_timeout_secs: u64,
}

impl Default for LocalNotifier {
    fn default() -> LocalNotifier {
        LocalNotifier {
            sendchange_timeout_secs: SENDCHANGE_TIMEOUT_SECS,
        }
    }
}

fn spawn_err(program: &str) -> impl FnOnce(std::io::Error) -> NotificationError + '_ {
    move |source| NotificationError::Spawn {
        program: program.to_string(),
        source,
    }
}

impl LkgrNotifier for LocalNotifier {
    fn notify_master(&self, master: &str, revision: &str) -> Result<(), NotificationError> {
        let mut cmd = Command::new("timeout");
        cmd.arg(self.sendchange_timeout_secs.to_string());
        cmd.args(["buildbot", "sendchange", "--master", master, "--revision", revision]);
        cmd.args(["--branch", "src", "--who", "lkgr", "--category", "lkgr"]);
        cmd.arg("no file information");
        cmd.stdout(Stdio::null());

        let status = cmd.status().map_err(spawn_err("buildbot sendchange"))?;
        if !status.success() {
            if status.code() == Some(124) {
                warn!("Timeout while notifying {}", master);
            }
            return Err(NotificationError::CommandFailed {
                program: "buildbot sendchange".to_string(),
                status,
            });
        }
        Ok(())
    }

    fn send_mail(&self, mail: &Mail) -> Result<(), NotificationError> {
        let mut child = Command::new("sendmail")
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(spawn_err("sendmail"))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(mail.to_message().as_bytes())
                .map_err(spawn_err("sendmail"))?;
        }
        let status = child.wait().map_err(spawn_err("sendmail"))?;
        if !status.success() {
            return Err(NotificationError::CommandFailed {
                program: "sendmail".to_string(),
                status,
            });
        }
        Ok(())
    }
}

/// Who hears about what, for one project.
pub struct LkgrAnnouncer<'a> {
    pub notifier: &'a dyn LkgrNotifier,
    pub project: String,
    pub sender: String,
    /// `host:port` of masters that get a change for every new LKGR.
    pub masters: Vec<String>,
    /// `None` unless error mail is turned on.
    pub error_recipients: Option<Vec<String>>,
    pub update_recipients: Vec<String>,
    pub dry_run: bool,
}

impl LkgrAnnouncer<'_> {
    /// Sends the new LKGR to every configured master. A master that fails
    /// does not stop the others.
    pub fn notify_masters(&self, revision: &str) -> Vec<NotificationError> {
        let mut errors = Vec::new();
        for master in &self.masters {
            if self.dry_run {
                info!("Would notify {} of {} (dry run)", master, revision);
                continue;
            }
            info!("Notifying {} of {}", master, revision);
            if let Err(e) = self.notifier.notify_master(master, revision) {
                warn!("could not notify {}: {}", master, e);
                errors.push(e);
            }
        }
        errors
    }

    /// Mails the update recipients that the LKGR moved to `revision`.
    pub fn announce_update(&self, revision: &str, manual: bool) -> Result<(), NotificationError> {
        if self.update_recipients.is_empty() || self.dry_run {
            return Ok(());
        }
        let mut subject = format!("Updated {} LKGR to {}", self.project, revision);
        if manual {
            subject.push_str(" (manually)");
        }
        let body = format!("{}.", subject);
        self.notifier.send_mail(&Mail {
            from: self.sender.clone(),
            to: self.update_recipients.clone(),
            subject,
            body,
        })
    }

    /// Mails the error recipients `problem` along with the run log.
    pub fn report_error(&self, problem: &str, log: &[String]) -> Result<(), NotificationError> {
        let Some(recipients) = &self.error_recipients else {
            return Ok(());
        };
        self.notifier.send_mail(&Mail {
            from: self.sender.clone(),
            to: recipients.clone(),
            subject: format!("{}{}", SUBJECT_PREFIX, problem),
            body: log.join("\n"),
        })
    }
}
