//! Incremental discovery of builds that changed since the last scan.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use log::{info, warn};

use crate::build_db::{BuildDb, BuildKey, BuildScanEntry};
use crate::buildbot::{BuildJson, BuildRecord, MasterJson};
use crate::errors::FetchError;

pub const DEFAULT_PARALLELISM: usize = 16;

/// Where builds come from. Implemented over HTTP by
/// [`crate::http::BuildbotClient`] and by fixtures in tests.
pub trait BuildSource: Sync {
    /// The master's summary: builder names with cached and running builds.
    fn master(&self, master_url: &str) -> Result<MasterJson, FetchError>;

    fn build(&self, master_url: &str, builder: &str, number: u64) -> Result<BuildJson, FetchError>;

    /// Every build the master still remembers for `builder`, keyed by number.
    fn builder_history(
        &self,
        master_url: &str,
        builder: &str,
    ) -> Result<BTreeMap<String, BuildJson>, FetchError>;
}

/// Runs `f` over `items` on at most `parallelism` scoped threads. Results
/// come back in input order.
pub fn parallel_map<T, R, F>(items: Vec<T>, parallelism: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    let workers = parallelism.max(1).min(total);
    let queue = Mutex::new(items.into_iter().enumerate());
    let results = Mutex::new(Vec::with_capacity(total));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue.lock().ok().and_then(|mut q| q.next());
                let Some((index, item)) = next else {
                    break;
                };
                let out = f(item);
                if let Ok(mut results) = results.lock() {
                    results.push((index, out));
                }
            });
        }
    });

    let mut results = results
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, out)| out).collect()
}

/// Build numbers worth fetching on each builder of one master.
///
/// A builder the ledger has never seen records its newest cached build as
/// finished so that its whole history does not alarm at once; only its
/// running builds are scanned.
pub fn find_new_builds(
    master_url: &str,
    master: &MasterJson,
    db: &mut BuildDb,
) -> BTreeMap<String, Vec<u64>> {
    let mut new_builds = BTreeMap::new();
    for (builder_name, builder) in &master.builders {
        let candidates: BTreeSet<u64> = builder
            .cached_builds
            .iter()
            .chain(&builder.current_builds)
            .copied()
            .collect();

        let numbers: Vec<u64> = if let Some(last) = db.last_finished(master_url, builder_name) {
            candidates.into_iter().filter(|n| *n > last).collect()
        } else if db.builds(master_url, builder_name).is_some() {
            candidates.into_iter().collect()
        } else {
            let running: BTreeSet<u64> = builder.current_builds.iter().copied().collect();
            let newest_finished = builder
                .cached_builds
                .iter()
                .filter(|n| !running.contains(n))
                .max();
            if let Some(&number) = newest_finished {
                db.put(
                    &BuildKey::new(master_url, builder_name, number),
                    BuildScanEntry {
                        finished: true,
                        ..BuildScanEntry::default()
                    },
                );
            }
            running.into_iter().collect()
        };
        new_builds.insert(builder_name.clone(), numbers);
    }
    new_builds
}

/// Marks fetched builds in the ledger. Unfinished builds are never counted
/// as succeeded.
pub fn propagate_to_db(db: &mut BuildDb, builds: &[BuildRecord]) {
    for build in builds {
        let key = BuildKey::new(&build.master_url, &build.builder_name, build.build_number);
        let entry = db.update(&key);
        if build.finished() {
            entry.finished = true;
        } else {
            entry.succeeded = false;
        }
    }
}

/// What one scan of a set of masters observed.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub masters: BTreeMap<String, MasterJson>,
    pub builds: Vec<BuildRecord>,
}

/// Fetches every new or still-running build on `masters` and records them
/// in the ledger. Individual fetch failures are logged and skipped.
pub fn get_updated_builds(
    masters: &[String],
    db: &mut BuildDb,
    source: &dyn BuildSource,
    parallelism: usize,
) -> ScanResult {
    let mut result = ScanResult::default();
    let mut requests = Vec::new();
    for master_url in masters {
        info!("opening {}/json", master_url);
        let master = match source.master(master_url) {
            Ok(master) => master,
            Err(e) => {
                warn!("skipping master {}: {}", master_url, e);
                continue;
            }
        };
        let project = master
            .project
            .title
            .clone()
            .unwrap_or_else(|| master_url.clone());
        for (builder, numbers) in find_new_builds(master_url, &master, db) {
            for number in numbers {
                requests.push((master_url.clone(), project.clone(), builder.clone(), number));
            }
        }
        result.masters.insert(master_url.clone(), master);
    }

    result.builds = parallel_map(requests, parallelism, |(master_url, project, builder, number)| {
        match source.build(&master_url, &builder, number) {
            Ok(json) => Some(BuildRecord::from_json(&master_url, &project, json)),
            Err(e) => {
                warn!("skipping {} build {} on {}: {}", builder, number, master_url, e);
                None
            }
        }
    })
    .into_iter()
    .flatten()
    .collect();

    propagate_to_db(db, &result.builds);
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buildbot::BuilderJson;

    pub(crate) const MASTER: &str = "http://build.example.com/p/chromium";

    /// Serves canned master and build JSON.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub(crate) masters: BTreeMap<String, MasterJson>,
        pub(crate) builds: BTreeMap<(String, String, u64), BuildJson>,
        pub(crate) histories: BTreeMap<(String, String), BTreeMap<String, BuildJson>>,
    }

    fn missing(what: String) -> FetchError {
        FetchError::Url(what)
    }

    impl BuildSource for FakeSource {
        fn master(&self, master_url: &str) -> Result<MasterJson, FetchError> {
            self.masters
                .get(master_url)
                .cloned()
                .ok_or_else(|| missing(master_url.to_string()))
        }

        fn build(&self, master_url: &str, builder: &str, number: u64) -> Result<BuildJson, FetchError> {
            self.builds
                .get(&(master_url.to_string(), builder.to_string(), number))
                .cloned()
                .ok_or_else(|| missing(format!("{} {} {}", master_url, builder, number)))
        }

        fn builder_history(
            &self,
            master_url: &str,
            builder: &str,
        ) -> Result<BTreeMap<String, BuildJson>, FetchError> {
            self.histories
                .get(&(master_url.to_string(), builder.to_string()))
                .cloned()
                .ok_or_else(|| missing(format!("{} {}", master_url, builder)))
        }
    }

    fn master_json(builders: &[(&str, &[u64], &[u64])]) -> MasterJson {
        MasterJson {
            builders: builders
                .iter()
                .map(|(name, cached, current)| {
                    let builder = BuilderJson {
                        cached_builds: cached.to_vec(),
                        current_builds: current.to_vec(),
                    };
                    (name.to_string(), builder)
                })
                .collect(),
            ..MasterJson::default()
        }
    }

    #[test]
    fn new_builder_skips_history() {
        let mut db = BuildDb::new();
        let master = master_json(&[("Linux", &[1, 2, 3, 4], &[4])]);
        let new = find_new_builds(MASTER, &master, &mut db);
        assert_eq!(new["Linux"], vec![4]);
        assert_eq!(db.last_finished(MASTER, "Linux"), Some(3));
    }

    #[test]
    fn known_builder_scans_after_last_finished() {
        let mut db = BuildDb::new();
        db.put(
            &BuildKey::new(MASTER, "Linux", 2),
            BuildScanEntry {
                finished: true,
                ..BuildScanEntry::default()
            },
        );
        let master = master_json(&[("Linux", &[1, 2, 3], &[4, 5])]);
        let new = find_new_builds(MASTER, &master, &mut db);
        assert_eq!(new["Linux"], vec![3, 4, 5]);
    }

    #[test]
    fn builder_without_finished_builds_scans_everything() {
        let mut db = BuildDb::new();
        db.put(&BuildKey::new(MASTER, "Linux", 3), BuildScanEntry::default());
        let master = master_json(&[("Linux", &[1, 2, 3], &[3])]);
        let new = find_new_builds(MASTER, &master, &mut db);
        assert_eq!(new["Linux"], vec![1, 2, 3]);
    }

    #[test]
    fn fetch_failures_are_skipped() {
        let mut source = FakeSource::default();
        source
            .masters
            .insert(MASTER.to_string(), master_json(&[("Linux", &[], &[7, 8])]));
        source.builds.insert(
            (MASTER.to_string(), "Linux".to_string(), 8),
            BuildJson {
                builder_name: "Linux".to_string(),
                number: 8,
                results: Some(0),
                ..BuildJson::default()
            },
        );
        let masters = vec![MASTER.to_string(), "http://build.example.com/p/gone".to_string()];
        let mut db = BuildDb::new();
        let scan = get_updated_builds(&masters, &mut db, &source, 4);
        assert_eq!(scan.builds.len(), 1);
        assert_eq!(scan.builds[0].build_number, 8);
        assert_eq!(scan.masters.len(), 1);
        assert!(db.get(&BuildKey::new(MASTER, "Linux", 8)).unwrap().finished);
        assert!(db.get(&BuildKey::new(MASTER, "Linux", 7)).is_none());
    }

    #[test]
    fn parallel_map_keeps_order() {
        let out = parallel_map((0..100).collect(), 7, |n: u32| n * 2);
        assert_eq!(out, (0..100).map(|n| n * 2).collect::<Vec<_>>());
        assert!(parallel_map(Vec::<u32>::new(), 4, |n| n).is_empty());
    }
}
