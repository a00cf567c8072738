// Copyright 2018 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Custom errors for the gatekeeper and the LKGR finder

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Configuration could not be loaded or does not describe the masters asked
/// for. Always fatal for the current invocation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Syntax errors, unknown keys and mistyped values.
    #[error("Invalid config {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid config {path}: {source}")]
    MalformedToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("Builder {builder} on {master} references unknown category {category:?}")]
    UnknownCategory {
        master: String,
        builder: String,
        category: String,
    },
    #[error("The following masters are not present in the config: {}", .0.join(", "))]
    MastersNotConfigured(Vec<String>),
    #[error("Unknown project {0:?}")]
    UnknownProject(String),
}

/// A single fetch from a build source failed. Callers log and skip the item.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("A reqwest error occurred fetching {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Bad url {0}")]
    Url(String),
}

/// The build-scan ledger could not be read or written.
#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("Could not access build db {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Build db {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not serialize build db: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Build db {0} is locked by another process")]
    Busy(PathBuf),
}

/// Talking to the tree status app, the mailer or the sheriff rota failed.
#[derive(thiserror::Error, Debug)]
pub enum NotificationError {
    #[error("A reqwest error occurred talking to {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} rejected the request with {code}: {body}")]
    Rejected {
        url: String,
        code: u16,
        body: String,
    },
    #[error("Could not decode tree status from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not fetch sheriffs for {class}: {reason}")]
    Sheriff { class: String, reason: String },
    #[error("Could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed: {status}")]
    CommandFailed { program: String, status: ExitStatus },
}

/// A local checkout could not be used to order revisions.
#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("Could not open git checkout at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },
    #[error("Could not walk the history of {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },
}

#[derive(thiserror::Error, Debug)]
#[error("exiting with {0}")]
pub struct ExitStatusError(pub i32);
