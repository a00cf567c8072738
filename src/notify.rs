//! Outbound collaborators: the tree status app, the mailer app and the
//! sheriff rota. The gatekeeper only sees the traits; the HTTP
//! implementations live here too.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use log::{debug, info};
use rand::Rng;
use regex::Regex;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::buildbot::Change;
use crate::errors::NotificationError;

pub const DEFAULT_STATUS_URL: &str = "https://chromium-status.appspot.com";
pub const DEFAULT_EMAIL_APP_URL: &str = "https://chromium-build.appspot.com/mailer";
pub const DEFAULT_SHERIFF_URL: &str = "http://build.chromium.org/p/chromium/%s.js";

/// Placeholder the sheriff rota uses when nobody is on duty.
const NO_SHERIFF: &str = "None (channel is sheriff)";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TreeState {
    #[serde(default)]
    pub message: String,
    pub general_state: String,
}

impl TreeState {
    pub fn is_open(&self) -> bool {
        self.general_state == "open"
    }

    pub fn is_closed(&self) -> bool {
        self.general_state == "closed"
    }
}

pub trait TreeStatus {
    fn current(&self) -> Result<TreeState, NotificationError>;
    fn set(&self, message: &str) -> Result<(), NotificationError>;
}

pub trait Mailer {
    fn send(&self, email: &Email) -> Result<(), NotificationError>;
}

pub trait SheriffSource {
    fn sheriffs(&self, class: &str) -> Result<BTreeSet<String>, NotificationError>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmailStep {
    pub name: String,
    pub text: Vec<Value>,
    pub logs: Vec<Value>,
    pub urls: Value,
    pub started: bool,
    /// The step's result code, 0 if it never ran.
    pub results: Value,
}

/// What the mailer renders a failure email from.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmailPayload {
    pub build_url: String,
    pub from_addr: String,
    pub project_name: String,
    pub subject_template: String,
    pub steps: Vec<EmailStep>,
    pub unsatisfied: Vec<String>,
    pub waterfall_url: String,
    #[serde(rename = "builderName")]
    pub builder_name: String,
    pub number: u64,
    pub reason: Option<String>,
    pub result: i64,
    pub blamelist: Vec<String>,
    pub changes: Vec<Change>,
    pub revisions: Vec<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Email {
    pub payload: EmailPayload,
    pub recipients: BTreeSet<String>,
}

impl Email {
    /// The JSON the mailer expects: the payload plus `recipients`.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.payload)?;
        if let Value::Object(map) = &mut value {
            let recipients = self.recipients.iter().cloned().map(Value::String).collect();
            map.insert("recipients".to_string(), Value::Array(recipients));
        }
        serde_json::to_string(&value)
    }
}

/// Merges emails with identical payloads into one send per payload.
pub fn dedupe_emails(emails: Vec<Email>) -> Vec<Email> {
    let mut merged: Vec<Email> = Vec::new();
    for email in emails {
        match merged.iter_mut().find(|e| e.payload == email.payload) {
            Some(existing) => existing.recipients.extend(email.recipients),
            None => merged.push(email),
        }
    }
    merged
}

pub(crate) fn check_response(url: &str, response: Response) -> Result<Response, NotificationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(NotificationError::Rejected {
        url: url.to_string(),
        code: status.as_u16(),
        body: response.text().unwrap_or_default(),
    })
}

pub(crate) fn http_err(url: &str) -> impl FnOnce(reqwest::Error) -> NotificationError + '_ {
    move |source| NotificationError::Http {
        url: url.to_string(),
        source,
    }
}

/// chromium-status style tree status app.
pub struct StatusApp {
    client: Client,
    url: String,
    username: String,
    password: Option<String>,
}

impl StatusApp {
    pub fn new(client: Client, url: &str, username: &str, password: Option<String>) -> StatusApp {
        StatusApp {
            client,
            url: url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password,
        }
    }
}

impl TreeStatus for StatusApp {
    fn current(&self) -> Result<TreeState, NotificationError> {
        let url = format!("{}/current?format=json", self.url);
        debug!("fetching tree status from <{}>", url);
        let response = self.client.get(&url).send().map_err(http_err(&url))?;
        let body = check_response(&url, response)?
            .text()
            .map_err(http_err(&url))?;
        serde_json::from_str(&body).map_err(|source| NotificationError::Decode { url, source })
    }

    fn set(&self, message: &str) -> Result<(), NotificationError> {
        let url = format!("{}/status", self.url);
        info!("setting tree status to {:?}", message);
        let password = self.password.as_deref().unwrap_or_default();
        let form = [
            ("message", message),
            ("username", self.username.as_str()),
            ("password", password),
        ];
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .map_err(http_err(&url))?;
        check_response(&url, response)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignedMessage {
    pub message: String,
    pub time: f64,
    pub salt: u32,
    pub url: String,
    #[serde(rename = "hmac-sha256")]
    pub hmac_sha256: String,
}

/// HMAC-SHA256 over the message, the timestamp and the salt, in that order.
pub fn sign_message(message: &str, url: &str, secret: &[u8], time: f64, salt: u32) -> SignedMessage {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    mac.update(time.to_string().as_bytes());
    mac.update(salt.to_string().as_bytes());
    SignedMessage {
        message: message.to_string(),
        time,
        salt,
        url: url.to_string(),
        hmac_sha256: hex::encode(mac.finalize().into_bytes()),
    }
}

/// The chromium-build mailer app.
pub struct MailerApp {
    client: Client,
    url: String,
    secret: Vec<u8>,
}

impl MailerApp {
    pub fn new(client: Client, url: &str, secret: Vec<u8>) -> MailerApp {
        MailerApp {
            client,
            url: url.trim_end_matches('/').to_string(),
            secret,
        }
    }
}

impl Mailer for MailerApp {
    fn send(&self, email: &Email) -> Result<(), NotificationError> {
        let url = format!("{}/email", self.url);
        let message = email.to_json().map_err(|source| NotificationError::Decode {
            url: url.clone(),
            source,
        })?;
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let salt = rand::thread_rng().gen::<u32>();
        let signed = sign_message(&message, &url, &self.secret, time, salt);
        let params = serde_json::to_string(&signed).map_err(|source| NotificationError::Decode {
            url: url.clone(),
            source,
        })?;

        info!(
            "sending email about {} build {} to {}",
            email.payload.builder_name,
            email.payload.number,
            email.recipients.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        let response = self
            .client
            .post(&url)
            .form(&[("json", params)])
            .send()
            .map_err(http_err(&url))?;
        check_response(&url, response)?;
        Ok(())
    }
}

/// Extracts sheriff addresses from a rota `.js` file.
pub fn parse_sheriffs(body: &str) -> BTreeSet<String> {
    let line = body.lines().next().unwrap_or_default().trim();
    static DOCUMENT_WRITE: OnceLock<Regex> = OnceLock::new();
    let re = DOCUMENT_WRITE
        .get_or_init(|| Regex::new(r"^document\.write\('(.*)'\)").unwrap());
    let Some(captures) = re.captures(line) else {
        return BTreeSet::new();
    };
    captures[1]
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != NO_SHERIFF)
        .map(|name| {
            if name.contains('@') {
                name.to_string()
            } else {
                format!("{}@google.com", name)
            }
        })
        .collect()
}

/// Fetches sheriff rotas from a URL pattern where `%s` is the class.
pub struct SheriffRota {
    client: Client,
    url_pattern: String,
}

impl SheriffRota {
    pub fn new(client: Client, url_pattern: &str) -> SheriffRota {
        SheriffRota {
            client,
            url_pattern: url_pattern.to_string(),
        }
    }
}

impl SheriffSource for SheriffRota {
    fn sheriffs(&self, class: &str) -> Result<BTreeSet<String>, NotificationError> {
        let url = self.url_pattern.replace("%s", class);
        debug!("fetching sheriffs from <{}>", url);
        let sheriff_err = |reason: String| NotificationError::Sheriff {
            class: class.to_string(),
            reason,
        };
        let body = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| sheriff_err(e.to_string()))?;
        Ok(parse_sheriffs(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheriff_file() {
        let sheriffs = parse_sheriffs("document.write('alice, bob@chromium.org')\n");
        assert_eq!(
            sheriffs.into_iter().collect::<Vec<_>>(),
            vec!["alice@google.com".to_string(), "bob@chromium.org".to_string()]
        );
        assert!(parse_sheriffs("document.write('None (channel is sheriff)')").is_empty());
        assert!(parse_sheriffs("garbage").is_empty());
        assert!(parse_sheriffs("").is_empty());
    }

    #[test]
    fn signing_is_deterministic() {
        let a = sign_message("{}", "http://mailer/email", b"secret", 1.5, 42);
        let b = sign_message("{}", "http://mailer/email", b"secret", 1.5, 42);
        let c = sign_message("{}", "http://mailer/email", b"other", 1.5, 42);
        assert_eq!(a, b);
        assert_ne!(a.hmac_sha256, c.hmac_sha256);
        assert_eq!(a.hmac_sha256.len(), 64);
        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["salt"], 42);
        assert!(json.get("hmac-sha256").is_some());
    }

    fn payload(number: u64) -> EmailPayload {
        EmailPayload {
            build_url: format!("http://build/builders/Linux/builds/{}", number),
            from_addr: "buildbot@example.com".to_string(),
            project_name: "Chromium".to_string(),
            subject_template: "s".to_string(),
            steps: vec![],
            unsatisfied: vec!["compile".to_string()],
            waterfall_url: "http://build".to_string(),
            builder_name: "Linux".to_string(),
            number,
            reason: None,
            result: 2,
            blamelist: vec![],
            changes: vec![],
            revisions: vec![],
        }
    }

    #[test]
    fn identical_payloads_merge() {
        let to = |who: &str| [who.to_string()].into_iter().collect::<BTreeSet<_>>();
        let emails = vec![
            Email { payload: payload(1), recipients: to("a@example.com") },
            Email { payload: payload(2), recipients: to("b@example.com") },
            Email { payload: payload(1), recipients: to("c@example.com") },
        ];
        let merged = dedupe_emails(emails);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].recipients.len(), 2);

        let json: Value = serde_json::from_str(&merged[0].to_json().unwrap()).unwrap();
        assert_eq!(json["recipients"], serde_json::json!(["a@example.com", "c@example.com"]));
        assert_eq!(json["builderName"], "Linux");
    }

    #[test]
    fn tree_state_parsing() {
        let state: TreeState = serde_json::from_str(
            r#"{"message": "Tree is closed (Automatic: foo)", "general_state": "closed", "can_commit_freely": false}"#,
        )
        .unwrap();
        assert!(state.is_closed());
        assert!(!state.is_open());
    }
}
