//! The persistent build-scan ledger.
//!
//! Remembers, per `(master, builder, build number)`, whether the build had
//! finished when last seen and which steps have already triggered a
//! notification under which config section. Re-scanning the same builds is
//! therefore idempotent.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::errors::PersistenceError;

/// Bump whenever the on-disk layout changes; older files are moved aside.
pub const BUILD_DB_VERSION: u64 = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildScanEntry {
    pub finished: bool,
    #[serde(default)]
    pub succeeded: bool,
    /// Section hash to the steps that already fired for it.
    #[serde(default)]
    pub triggered: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildKey {
    pub master: String,
    pub builder: String,
    pub number: u64,
}

impl BuildKey {
    pub fn new(master: &str, builder: &str, number: u64) -> BuildKey {
        BuildKey {
            master: master.to_string(),
            builder: builder.to_string(),
            number,
        }
    }

    /// The same builder's build just before this one.
    pub fn previous(&self) -> Option<BuildKey> {
        Some(BuildKey {
            number: self.number.checked_sub(1)?,
            ..self.clone()
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Aux {
    /// Highest revision property values that have closed the tree so far.
    #[serde(default)]
    pub triggered_revisions: BTreeMap<String, Value>,
}

pub type BuilderBuilds = BTreeMap<u64, BuildScanEntry>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildDb {
    build_db_version: u64,
    #[serde(default)]
    masters: BTreeMap<String, BTreeMap<String, BuilderBuilds>>,
    /// Resolved content of every section hash referenced by `masters`.
    #[serde(default)]
    pub sections: BTreeMap<String, Value>,
    #[serde(default)]
    pub aux: Aux,
}

impl Default for BuildDb {
    fn default() -> BuildDb {
        BuildDb {
            build_db_version: BUILD_DB_VERSION,
            masters: BTreeMap::new(),
            sections: BTreeMap::new(),
            aux: Aux::default(),
        }
    }
}

impl BuildDb {
    pub fn new() -> BuildDb {
        BuildDb::default()
    }

    pub fn get(&self, key: &BuildKey) -> Option<&BuildScanEntry> {
        self.masters.get(&key.master)?.get(&key.builder)?.get(&key.number)
    }

    pub fn put(&mut self, key: &BuildKey, entry: BuildScanEntry) {
        self.builds_mut(&key.master, &key.builder).insert(key.number, entry);
    }

    /// The entry for `key`, inserted as unfinished if absent.
    pub fn update(&mut self, key: &BuildKey) -> &mut BuildScanEntry {
        self.builds_mut(&key.master, &key.builder)
            .entry(key.number)
            .or_default()
    }

    /// Adds `steps` to what `key` has triggered under `section_hash`.
    /// Nothing is ever removed from a triggered set.
    pub fn record_trigger<'a, I>(&mut self, key: &BuildKey, section_hash: &str, steps: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        self.update(key)
            .triggered
            .entry(section_hash.to_string())
            .or_default()
            .extend(steps.into_iter().cloned());
    }

    pub fn builds(&self, master: &str, builder: &str) -> Option<&BuilderBuilds> {
        self.masters.get(master)?.get(builder)
    }

    fn builds_mut(&mut self, master: &str, builder: &str) -> &mut BuilderBuilds {
        self.masters
            .entry(master.to_string())
            .or_default()
            .entry(builder.to_string())
            .or_default()
    }

    pub fn last_finished(&self, master: &str, builder: &str) -> Option<u64> {
        self.builds(master, builder)?
            .iter()
            .rev()
            .find(|(_, entry)| entry.finished)
            .map(|(number, _)| *number)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BuildKey, &BuildScanEntry)> + '_ {
        self.masters.iter().flat_map(|(master, builders)| {
            builders.iter().flat_map(move |(builder, builds)| {
                builds
                    .iter()
                    .map(move |(number, entry)| (BuildKey::new(master, builder, *number), entry))
            })
        })
    }

    pub fn clear(&mut self) {
        *self = BuildDb::new();
    }

    /// Keeps unfinished builds and the newest finished build per builder.
    pub fn prune(&mut self) {
        for builders in self.masters.values_mut() {
            for builds in builders.values_mut() {
                let newest_finished = builds
                    .iter()
                    .rev()
                    .find(|(_, entry)| entry.finished)
                    .map(|(number, _)| *number);
                builds.retain(|number, entry| !entry.finished || Some(*number) == newest_finished);
            }
        }
    }

    /// Section hashes referenced by any remaining build.
    pub fn referenced_sections(&self) -> BTreeSet<String> {
        self.iter()
            .flat_map(|(_, entry)| entry.triggered.keys().cloned())
            .collect()
    }

    /// Reads the ledger at `path`. A missing file is an empty ledger; a file
    /// written with another schema version is moved to `<path>.old`.
    pub fn load(path: &Path) -> Result<BuildDb, PersistenceError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no build db at {}, starting fresh", path.display());
                return Ok(BuildDb::new());
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let corrupt = |source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        };
        let value: Value = serde_json::from_str(&contents).map_err(corrupt)?;
        let version = value.get("build_db_version").and_then(Value::as_u64);
        if version != Some(BUILD_DB_VERSION) {
            let old = old_path(path);
            warn!(
                "build db {} has version {:?}, expected {}; moving it to {}",
                path.display(),
                version,
                BUILD_DB_VERSION,
                old.display()
            );
            fs::rename(path, &old).map_err(|source| PersistenceError::Io {
                path: old.clone(),
                source,
            })?;
            return Ok(BuildDb::new());
        }
        serde_json::from_value(value).map_err(corrupt)
    }

    /// Prunes and atomically replaces the file at `path`.
    pub fn save(&mut self, path: &Path) -> Result<(), PersistenceError> {
        self.prune();
        let referenced = self.referenced_sections();
        self.sections.retain(|hash, _| referenced.contains(hash));

        let io_err = |source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
        serde_json::to_writer_pretty(&mut tmp, self).map_err(PersistenceError::Serialize)?;
        tmp.write_all(b"\n").map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        debug!("wrote build db to {}", path.display());
        Ok(())
    }
}

fn old_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".old");
    PathBuf::from(name)
}

/// Exclusive claim on a ledger file. Only one scan may hold it at a time.
///
/// This is an advisory lock on `<db>.lock`, so the kernel releases it when
/// the holder exits, however it exits. The file itself is left in place and
/// only records the pid of the last holder.
#[derive(Debug)]
pub struct BuildDbLock {
    path: PathBuf,
    file: File,
}

impl BuildDbLock {
    pub fn acquire(db_path: &Path) -> Result<BuildDbLock, PersistenceError> {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        let io_err = |source| PersistenceError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(PersistenceError::Busy(db_path.to_path_buf()));
            }
            return Err(io_err(e));
        }
        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        debug!("locked {}", path.display());
        Ok(BuildDbLock { path, file })
    }
}

impl Drop for BuildDbLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("could not unlock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    const MASTER: &str = "http://build.example.com/p/chromium";

    fn key(builder: &str, number: u64) -> BuildKey {
        BuildKey::new(MASTER, builder, number)
    }

    fn finished() -> BuildScanEntry {
        BuildScanEntry {
            finished: true,
            ..BuildScanEntry::default()
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = BuildDb::load(&dir.path().join("build_db.json")).unwrap();
        assert_eq!(db, BuildDb::new());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_db.json");
        let mut db = BuildDb::new();
        db.put(&key("Linux", 7), finished());
        db.record_trigger(&key("Linux", 8), "abc", &["compile".to_string()]);
        db.sections.insert("abc".to_string(), serde_json::json!({"Linux": {}}));
        db.sections.insert("stale".to_string(), serde_json::json!({}));
        db.save(&path).unwrap();

        let reloaded = BuildDb::load(&path).unwrap();
        assert_eq!(reloaded.get(&key("Linux", 7)), Some(&finished()));
        let running = reloaded.get(&key("Linux", 8)).unwrap();
        assert!(!running.finished);
        assert_eq!(running.triggered["abc"].len(), 1);
        assert!(reloaded.sections.contains_key("abc"));
        assert!(!reloaded.sections.contains_key("stale"));
    }

    #[test]
    fn prune_keeps_newest_finished_and_unfinished() {
        let mut db = BuildDb::new();
        db.put(&key("Linux", 1), finished());
        db.put(&key("Linux", 2), finished());
        db.put(&key("Linux", 3), BuildScanEntry::default());
        db.put(&key("Linux", 4), BuildScanEntry::default());
        db.put(&key("Mac", 9), finished());
        db.prune();
        let left: Vec<_> = db.iter().map(|(k, _)| (k.builder, k.number)).collect();
        assert_eq!(
            left,
            vec![
                ("Linux".to_string(), 2),
                ("Linux".to_string(), 3),
                ("Linux".to_string(), 4),
                ("Mac".to_string(), 9)
            ]
        );
        assert_eq!(db.last_finished(MASTER, "Linux"), Some(2));
        assert_eq!(db.last_finished(MASTER, "Win"), None);
    }

    #[test]
    fn old_versions_are_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_db.json");
        fs::write(&path, r#"{"build_db_version": 1, "masters": {}}"#).unwrap();
        let db = BuildDb::load(&path).unwrap();
        assert_eq!(db, BuildDb::new());
        assert!(!path.exists());
        assert!(dir.path().join("build_db.json.old").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_db.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            BuildDb::load(&path),
            Err(PersistenceError::Corrupt { .. })
        ));
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_db.json");
        let lock = BuildDbLock::acquire(&path).unwrap();
        assert!(matches!(
            BuildDbLock::acquire(&path),
            Err(PersistenceError::Busy(_))
        ));
        drop(lock);
        BuildDbLock::acquire(&path).unwrap();
    }

    #[test]
    fn lock_left_by_a_killed_scan_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build_db.json");
        // A holder that died without cleaning up leaves its pid behind.
        fs::write(dir.path().join("build_db.json.lock"), "4242\n").unwrap();
        let lock = BuildDbLock::acquire(&path).unwrap();
        let pid = fs::read_to_string(dir.path().join("build_db.json.lock")).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
        drop(lock);
    }

    #[test]
    fn previous_build() {
        assert_eq!(key("Linux", 5).previous(), Some(key("Linux", 4)));
        assert_eq!(key("Linux", 0).previous(), None);
    }

    #[test]
    fn qc_prop_triggered_sets_only_grow() {
        fn prop(batches: Vec<Vec<u8>>) -> TestResult {
            let mut db = BuildDb::new();
            let k = key("Linux", 1);
            let mut seen = BTreeSet::new();
            for batch in batches {
                let steps: Vec<String> = batch.iter().map(|s| format!("step{}", s % 8)).collect();
                db.record_trigger(&k, "hash", &steps);
                seen.extend(steps);
                let recorded = db
                    .get(&k)
                    .and_then(|e| e.triggered.get("hash"))
                    .cloned()
                    .unwrap_or_default();
                if recorded != seen {
                    return TestResult::failed();
                }
            }
            TestResult::passed()
        }
        QuickCheck::new().quickcheck(prop as fn(_) -> _);
    }
}
