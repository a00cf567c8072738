//! Orderings over revision identifiers.
//!
//! The LKGR sweep only needs to know which of two revisions is newer, how
//! many revisions apart they are and when a revision was committed. SVN
//! revisions answer all three arithmetically; git revisions need a local
//! checkout.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use git2::{Repository, Sort};
use log::debug;
use regex::Regex;

use crate::errors::RepositoryError;

pub trait RevisionOrder: Sync {
    /// Whether `revision` is well formed and known to this ordering.
    fn check(&self, revision: &str) -> bool;

    /// Total order over revisions that pass [`RevisionOrder::check`].
    fn cmp(&self, a: &str, b: &str) -> Ordering;

    /// How many revisions `to` is ahead of `from`.
    fn gap(&self, from: &str, to: &str) -> Option<i64>;

    fn commit_time(&self, revision: &str) -> Option<DateTime<Utc>>;

    /// The revision as a number, for orderings where that is meaningful.
    fn numeric(&self, _revision: &str) -> Option<i64> {
        None
    }
}

/// Positive integers, as handed out by subversion.
#[derive(Clone, Debug, Default)]
pub struct SvnOrder {
    /// Repository queried for commit dates.
    pub svn_url: Option<String>,
}

impl SvnOrder {
    pub fn new(svn_url: Option<String>) -> SvnOrder {
        SvnOrder { svn_url }
    }
}

fn svn_number(revision: &str) -> Option<i64> {
    revision.trim().parse().ok().filter(|n| *n > 0)
}

/// Pulls the commit date out of `svn log --xml` output.
pub fn parse_svn_log_date(xml: &str) -> Option<DateTime<Utc>> {
    static DATE: OnceLock<Regex> = OnceLock::new();
    let re = DATE.get_or_init(|| Regex::new(r"<date>(?P<dt>[^<]*)</date>").unwrap());
    let date = re.captures(xml)?.name("dt")?.as_str();
    let naive = NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S%.fZ").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

impl RevisionOrder for SvnOrder {
    fn check(&self, revision: &str) -> bool {
        svn_number(revision).is_some()
    }

    fn cmp(&self, a: &str, b: &str) -> Ordering {
        svn_number(a).cmp(&svn_number(b))
    }

    fn gap(&self, from: &str, to: &str) -> Option<i64> {
        Some(svn_number(to)? - svn_number(from)?)
    }

    fn commit_time(&self, revision: &str) -> Option<DateTime<Utc>> {
        let url = self.svn_url.as_deref()?;
        debug!("running svn log -r {} {}", revision, url);
        let output = Command::new("svn")
            .args(["log", "--non-interactive", "--xml", "-r", revision, url])
            .output()
            .ok()?;
        if !output.status.success() {
            debug!("svn log failed: {}", String::from_utf8_lossy(&output.stderr));
            return None;
        }
        parse_svn_log_date(&String::from_utf8_lossy(&output.stdout))
    }

    fn numeric(&self, revision: &str) -> Option<i64> {
        svn_number(revision)
    }
}

/// Full 40-hex-digit commit ids, ordered by their position in a
/// topological walk of a local checkout from `HEAD`, oldest first.
#[derive(Clone, Debug, Default)]
pub struct GitOrder {
    positions: HashMap<String, usize>,
    times: Vec<i64>,
}

impl GitOrder {
    pub fn open(path: &Path) -> Result<GitOrder, RepositoryError> {
        eprintln!("opening existing repository at {:?}", path);
        let repo = Repository::open(path).map_err(|source| RepositoryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let walk_err = |source| RepositoryError::Walk {
            path: path.to_path_buf(),
            source,
        };

        let mut walk = repo.revwalk().map_err(walk_err)?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)
            .map_err(walk_err)?;
        walk.push_head().map_err(walk_err)?;

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid.map_err(walk_err)?;
            let commit = repo.find_commit(oid).map_err(walk_err)?;
            commits.push((oid.to_string(), commit.time().seconds()));
        }
        debug!("walked {} commits in {:?}", commits.len(), path);
        Ok(GitOrder::from_history(commits))
    }

    /// Builds an ordering from `(sha, commit time)` pairs, oldest first.
    pub fn from_history<I: IntoIterator<Item = (String, i64)>>(history: I) -> GitOrder {
        let mut order = GitOrder::default();
        for (sha, time) in history {
            order.positions.insert(sha.to_lowercase(), order.times.len());
            order.times.push(time);
        }
        order
    }

    fn position(&self, revision: &str) -> Option<usize> {
        self.positions.get(&revision.to_lowercase()).copied()
    }
}

impl RevisionOrder for GitOrder {
    fn check(&self, revision: &str) -> bool {
        static SHA: OnceLock<Regex> = OnceLock::new();
        let re = SHA.get_or_init(|| Regex::new(r"^[a-fA-F0-9]{40}$").unwrap());
        re.is_match(revision) && self.position(revision).is_some()
    }

    fn cmp(&self, a: &str, b: &str) -> Ordering {
        self.position(a).cmp(&self.position(b))
    }

    fn gap(&self, from: &str, to: &str) -> Option<i64> {
        Some(self.position(to)? as i64 - self.position(from)? as i64)
    }

    fn commit_time(&self, revision: &str) -> Option<DateTime<Utc>> {
        let seconds = *self.times.get(self.position(revision)?)?;
        Utc.timestamp_opt(seconds, 0).single()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svn_revisions() {
        let order = SvnOrder::default();
        assert!(order.check("1234"));
        assert!(!order.check("0"));
        assert!(!order.check("-5"));
        assert!(!order.check("deadbeef"));
        assert_eq!(order.cmp("9", "10"), Ordering::Less);
        assert_eq!(order.gap("100", "250"), Some(150));
        assert_eq!(order.numeric("42"), Some(42));
        assert_eq!(order.commit_time("42"), None);
    }

    #[test]
    fn svn_log_dates() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<log>
<logentry revision="190000">
<author>someone@chromium.org</author>
<date>2013-03-01T18:04:05.123456Z</date>
<msg>Roll</msg>
</logentry>
</log>"#;
        let date = parse_svn_log_date(xml).unwrap();
        assert_eq!(date.to_rfc3339(), "2013-03-01T18:04:05.123456+00:00");
        assert_eq!(parse_svn_log_date("<log></log>"), None);
    }

    fn sha(n: u8) -> String {
        format!("{:040x}", n)
    }

    #[test]
    fn git_revisions() {
        let order = GitOrder::from_history((1..=5).map(|n| (sha(n), 1_000 * n as i64)));
        assert!(order.check(&sha(3)));
        assert!(order.check(&sha(3).to_uppercase()));
        assert!(!order.check(&sha(9)));
        assert!(!order.check("abc"));
        assert_eq!(order.cmp(&sha(2), &sha(4)), Ordering::Less);
        assert_eq!(order.gap(&sha(1), &sha(5)), Some(4));
        assert_eq!(order.gap(&sha(1), &sha(9)), None);
        assert_eq!(order.commit_time(&sha(2)).map(|t| t.timestamp()), Some(2_000));
        assert_eq!(order.numeric(&sha(2)), None);
    }
}
