//! Buildbot tree gatekeeping.
//!
//! Two tools share this crate. `gatekeeper` scans buildbot masters for new
//! builds, closes the tree and emails the people responsible when a
//! configured step fails, and reopens it once every builder that closed it
//! is green again. `lkgr-finder` sweeps the build history of a set of
//! builders for the newest revision on which all of them passed, and tells
//! masters and people when it moves or goes stale.

pub mod build_db;
pub mod build_scan;
pub mod buildbot;
pub mod config;
pub mod errors;
pub mod gatekeeper;
pub mod http;
pub mod lkgr;
pub mod lkgr_config;
pub mod lkgr_notify;
pub mod notify;
pub mod revision;
