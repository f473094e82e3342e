//! Key-addressed disk cache with TTL expiry.
//!
//! Layout: `{cache_dir}/{key}.json` holds the payload, `{key}.meta.json` the
//! metadata sidecar (creation time, TTL, item count, symbol). Inspection only
//! ever reads sidecars.
//!
//! Features:
//! - Atomic writes (write to a unique .tmp, rename into place; payload first,
//!   then the sidecar that makes the entry visible)
//! - Lazy expiry: `get` on a stale entry is a miss and purges it
//! - Corrupt or unreadable entries are misses, never errors

use super::clock::Clock;
use super::error::CacheError;
use crate::domain::{Granularity, PriceSeries};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PAYLOAD_EXT: &str = ".json";
const META_EXT: &str = ".meta.json";
const TMP_EXT: &str = ".tmp";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Deterministic cache key: `{granularity}_{blake3 hex}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a fetch request. The symbol is case-folded and both window
    /// bounds are hashed as UTC instants at nanosecond precision, so the same
    /// logical request always lands on the same key.
    pub fn for_request(
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Self {
        let canonical = format!(
            "v1|{}|{}|{}|{}|{}",
            symbol.trim().to_ascii_uppercase(),
            start.to_rfc3339_opts(SecondsFormat::Nanos, true),
            end.to_rfc3339_opts(SecondsFormat::Nanos, true),
            granularity.as_str(),
            multiplier.max(1),
        );
        let hash = blake3::hash(canonical.as_bytes()).to_hex();
        CacheKey(format!("{}_{}", granularity.as_str(), &hash[..32]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata sidecar for a cached entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: CacheKey,
    pub symbol: String,
    pub granularity: Granularity,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub item_count: usize,
}

impl CacheMeta {
    /// `None` when the TTL runs past the representable range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(Duration::from_secs(self.ttl_secs)).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub meta: CacheMeta,
    pub payload: PriceSeries,
}

/// Why a lookup produced nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum MissReason {
    NotFound,
    /// Stale entry; it has been purged.
    Expired,
    /// Unparseable or half-present entry; it has been purged.
    Corrupt(String),
    /// Storage could not be read.
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

/// Cache health computed from sidecars alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub oldest_age_secs: Option<i64>,
    pub newest_age_secs: Option<i64>,
    pub expired_count: usize,
    pub by_granularity: BTreeMap<Granularity, usize>,
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    cache_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `cache_dir`.
    pub fn open(cache_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| CacheError::io(&cache_dir, e))?;
        Ok(Self { cache_dir, clock })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{key}{PAYLOAD_EXT}"))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{key}{META_EXT}"))
    }

    /// Look up `key`. Never fails: every problem is a miss with a reason.
    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let meta = match read_json::<CacheMeta>(&self.meta_path(key)) {
            Ok(Some(meta)) => meta,
            Ok(None) => return CacheLookup::Miss(MissReason::NotFound),
            Err(ReadFailure::Io(msg)) => return CacheLookup::Miss(MissReason::Unavailable(msg)),
            Err(ReadFailure::Parse(msg)) => return self.purge_corrupt(key, msg),
        };

        if meta.is_expired(self.clock.utc_now()) {
            debug!(%key, "cache entry expired, purging");
            self.purge(key);
            return CacheLookup::Miss(MissReason::Expired);
        }

        match read_json::<PriceSeries>(&self.payload_path(key)) {
            Ok(Some(payload)) if payload.len() == meta.item_count => {
                CacheLookup::Hit(CacheEntry { meta, payload })
            }
            Ok(Some(payload)) => self.purge_corrupt(
                key,
                format!(
                    "payload holds {} items, metadata says {}",
                    payload.len(),
                    meta.item_count
                ),
            ),
            Ok(None) => self.purge_corrupt(key, "payload missing".into()),
            Err(ReadFailure::Io(msg)) => CacheLookup::Miss(MissReason::Unavailable(msg)),
            Err(ReadFailure::Parse(msg)) => self.purge_corrupt(key, msg),
        }
    }

    fn purge_corrupt(&self, key: &CacheKey, reason: String) -> CacheLookup {
        warn!(%key, %reason, "corrupt cache entry, purging");
        self.purge(key);
        CacheLookup::Miss(MissReason::Corrupt(reason))
    }

    fn purge(&self, key: &CacheKey) {
        remove_if_exists(&self.meta_path(key));
        remove_if_exists(&self.payload_path(key));
    }

    /// Store `payload` under `key` with the given TTL.
    pub fn set(
        &self,
        key: &CacheKey,
        symbol: &str,
        payload: &PriceSeries,
        ttl: Duration,
    ) -> Result<CacheMeta, CacheError> {
        let meta = CacheMeta {
            key: key.clone(),
            symbol: symbol.trim().to_ascii_uppercase(),
            granularity: payload.granularity(),
            created_at: self.clock.utc_now(),
            ttl_secs: ttl.as_secs(),
            item_count: payload.len(),
        };

        write_atomic(&self.payload_path(key), &serde_json::to_vec(payload)?)?;
        write_atomic(&self.meta_path(key), &serde_json::to_vec_pretty(&meta)?)?;
        debug!(%key, items = meta.item_count, ttl_secs = meta.ttl_secs, "cache entry written");
        Ok(meta)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let existed = self.meta_path(key).exists();
        self.purge(key);
        existed
    }

    /// Sidecars of every entry with readable metadata.
    pub fn entries(&self) -> Result<Vec<CacheMeta>, CacheError> {
        let mut out = Vec::new();
        for key in self.scan()?.metas {
            if let Ok(Some(meta)) = read_json::<CacheMeta>(&self.meta_path(&key)) {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Remove expired entries, entries with corrupt metadata or a missing
    /// payload, and stray temporary files. Returns the number of entries removed.
    pub fn clear_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.utc_now();
        let scan = self.scan()?;
        let mut removed = 0;

        for key in &scan.metas {
            let stale = match read_json::<CacheMeta>(&self.meta_path(key)) {
                Ok(Some(meta)) => meta.is_expired(now) || !self.payload_path(key).exists(),
                Ok(None) => false,
                Err(ReadFailure::Parse(_)) => true,
                Err(ReadFailure::Io(msg)) => {
                    warn!(%key, error = %msg, "unreadable cache metadata, skipping");
                    false
                }
            };
            if stale {
                self.purge(key);
                removed += 1;
            }
        }
        for tmp in &scan.tmps {
            remove_if_exists(tmp);
        }
        Ok(removed)
    }

    /// Remove everything. Returns the number of entries removed.
    pub fn clear_all(&self) -> Result<usize, CacheError> {
        let scan = self.scan()?;
        let mut keys = scan.metas;
        keys.extend(scan.payloads);
        keys.sort();
        keys.dedup();

        for key in &keys {
            self.purge(key);
        }
        for tmp in &scan.tmps {
            remove_if_exists(tmp);
        }
        Ok(keys.len())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = self.clock.utc_now();
        let mut stats = CacheStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut newest: Option<DateTime<Utc>> = None;

        for key in self.scan()?.metas {
            let meta_path = self.meta_path(&key);
            let Ok(Some(meta)) = read_json::<CacheMeta>(&meta_path) else {
                continue;
            };

            stats.entry_count += 1;
            stats.total_bytes += file_len(&meta_path) + file_len(&self.payload_path(&key));
            if meta.is_expired(now) {
                stats.expired_count += 1;
            }
            *stats.by_granularity.entry(meta.granularity).or_default() += 1;
            oldest = Some(oldest.map_or(meta.created_at, |t| t.min(meta.created_at)));
            newest = Some(newest.map_or(meta.created_at, |t| t.max(meta.created_at)));
        }

        stats.oldest_age_secs = oldest.map(|t| (now - t).num_seconds());
        stats.newest_age_secs = newest.map(|t| (now - t).num_seconds());
        Ok(stats)
    }

    fn scan(&self) -> Result<Scan, CacheError> {
        let mut scan = Scan::default();
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(CacheError::io(&self.cache_dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.cache_dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.ends_with(TMP_EXT) {
                scan.tmps.push(entry.path());
            } else if let Some(key) = name.strip_suffix(META_EXT) {
                scan.metas.push(CacheKey(key.to_string()));
            } else if let Some(key) = name.strip_suffix(PAYLOAD_EXT) {
                scan.payloads.push(CacheKey(key.to_string()));
            }
        }
        Ok(scan)
    }
}

#[derive(Default)]
struct Scan {
    metas: Vec<CacheKey>,
    payloads: Vec<CacheKey>,
    tmps: Vec<PathBuf>,
}

enum ReadFailure {
    Io(String),
    Parse(String),
}

/// `Ok(None)` when the file does not exist.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ReadFailure> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ReadFailure::Io(format!("{}: {e}", path.display()))),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ReadFailure::Parse(format!("{}: {e}", path.display())))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}.{n}{TMP_EXT}", std::process::id()));
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, bytes).map_err(|e| CacheError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        CacheError::io(path, e)
    })
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::clock::ManualClock;
    use crate::domain::BarRecord;
    use chrono::TimeZone;

    fn setup() -> (tempfile::TempDir, DiskCache, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap(),
        ));
        let cache = DiskCache::open(dir.path().join("cache"), clock.clone()).unwrap();
        (dir, cache, clock)
    }

    fn bars(n: usize) -> PriceSeries {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        PriceSeries::Bars {
            granularity: Granularity::Minute,
            bars: (0..n)
                .map(|i| BarRecord {
                    timestamp: t0 + chrono::Duration::minutes(i as i64),
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.5,
                    volume: 1_000,
                    vwap: None,
                    transactions: None,
                })
                .collect(),
        }
    }

    fn key(g: Granularity) -> CacheKey {
        CacheKey::for_request(
            "AAPL",
            Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 21, 0, 0).unwrap(),
            g,
            1,
        )
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn key_is_case_and_order_insensitive_but_granularity_sensitive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 15, 21, 0, 0).unwrap();
        let a = CacheKey::for_request("aapl ", start, end, Granularity::Minute, 1);
        let b = CacheKey::for_request("AAPL", start, end, Granularity::Minute, 1);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("minute_"));

        let c = CacheKey::for_request("AAPL", start, end, Granularity::Second, 1);
        assert_ne!(a, c);
        let d = CacheKey::for_request("AAPL", start, end, Granularity::Minute, 5);
        assert_ne!(a, d);
    }

    #[test]
    fn set_then_get_hits() {
        let (_dir, cache, _clock) = setup();
        let k = key(Granularity::Minute);
        let meta = cache.set(&k, "aapl", &bars(3), HOUR).unwrap();
        assert_eq!(meta.symbol, "AAPL");
        assert_eq!(meta.item_count, 3);

        match cache.get(&k) {
            CacheLookup::Hit(entry) => {
                assert_eq!(entry.payload, bars(3));
                assert_eq!(entry.meta, meta);
            }
            miss => panic!("expected hit, got {miss:?}"),
        }
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_dir, cache, _clock) = setup();
        assert_eq!(
            cache.get(&key(Granularity::Minute)),
            CacheLookup::Miss(MissReason::NotFound)
        );
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_purged() {
        let (_dir, cache, clock) = setup();
        let k = key(Granularity::Minute);
        cache.set(&k, "AAPL", &bars(2), HOUR).unwrap();

        clock.advance(Duration::from_secs(3599));
        assert!(cache.get(&k).is_hit());

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&k), CacheLookup::Miss(MissReason::Expired));
        assert!(!cache.meta_path(&k).exists());
        assert!(!cache.payload_path(&k).exists());
        assert_eq!(cache.get(&k), CacheLookup::Miss(MissReason::NotFound));
    }

    #[test]
    fn corrupt_payload_is_a_miss_and_is_purged() {
        let (_dir, cache, _clock) = setup();
        let k = key(Granularity::Minute);
        cache.set(&k, "AAPL", &bars(2), HOUR).unwrap();
        fs::write(cache.payload_path(&k), b"{not json").unwrap();

        assert!(matches!(
            cache.get(&k),
            CacheLookup::Miss(MissReason::Corrupt(_))
        ));
        assert!(!cache.meta_path(&k).exists());
    }

    #[test]
    fn truncated_payload_disagreeing_with_meta_is_corrupt() {
        let (_dir, cache, _clock) = setup();
        let k = key(Granularity::Minute);
        cache.set(&k, "AAPL", &bars(3), HOUR).unwrap();
        fs::write(
            cache.payload_path(&k),
            serde_json::to_vec(&bars(1)).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            cache.get(&k),
            CacheLookup::Miss(MissReason::Corrupt(_))
        ));
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let (_dir, cache, _clock) = setup();
        cache.set(&key(Granularity::Minute), "AAPL", &bars(2), HOUR).unwrap();
        let names: Vec<String> = fs::read_dir(cache.cache_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| !n.ends_with(TMP_EXT)));
    }

    #[test]
    fn clear_expired_removes_stale_corrupt_and_orphans() {
        let (_dir, cache, clock) = setup();
        let fresh = key(Granularity::Minute);
        let stale = key(Granularity::Second);
        let orphan = CacheKey("minute_orphan".into());
        let broken = CacheKey("minute_broken".into());

        cache.set(&stale, "AAPL", &bars(1), HOUR).unwrap();
        clock.advance(HOUR * 2);
        cache.set(&fresh, "AAPL", &bars(1), HOUR).unwrap();
        cache.set(&orphan, "AAPL", &bars(1), HOUR).unwrap();
        fs::remove_file(cache.payload_path(&orphan)).unwrap();
        fs::write(cache.meta_path(&broken), b"garbage").unwrap();
        fs::write(cache.cache_dir().join("x.json.1.2.tmp"), b"partial").unwrap();

        assert_eq!(cache.clear_expired().unwrap(), 3);
        assert!(cache.get(&fresh).is_hit());
        assert!(!cache.cache_dir().join("x.json.1.2.tmp").exists());
        assert_eq!(cache.stats().unwrap().entry_count, 1);
    }

    #[test]
    fn entries_list_metadata_oldest_first() {
        let (_dir, cache, clock) = setup();
        cache.set(&key(Granularity::Second), "AAPL", &bars(4), HOUR).unwrap();
        clock.advance(Duration::from_secs(60));
        cache.set(&key(Granularity::Minute), "AAPL", &bars(2), HOUR).unwrap();
        std::fs::write(cache.cache_dir().join("broken.meta.json"), "{").unwrap();

        let entries = cache.entries().unwrap();
        let keys: Vec<&CacheKey> = entries.iter().map(|m| &m.key).collect();
        assert_eq!(keys, vec![&key(Granularity::Second), &key(Granularity::Minute)]);
        assert_eq!(entries[0].item_count, 4);
        assert!(entries[0].created_at < entries[1].created_at);
    }

    #[test]
    fn remove_drops_one_entry() {
        let (_dir, cache, _clock) = setup();
        let minute = key(Granularity::Minute);
        let second = key(Granularity::Second);
        cache.set(&minute, "AAPL", &bars(1), HOUR).unwrap();
        cache.set(&second, "AAPL", &bars(1), HOUR).unwrap();

        assert!(cache.remove(&minute));
        assert!(!cache.remove(&minute));
        assert!(matches!(cache.get(&minute), CacheLookup::Miss(MissReason::NotFound)));
        assert!(cache.get(&second).is_hit());
        assert!(!cache.cache_dir().join(format!("{minute}.json")).exists());
    }

    #[test]
    fn clear_all_counts_entries() {
        let (_dir, cache, _clock) = setup();
        cache.set(&key(Granularity::Minute), "AAPL", &bars(1), HOUR).unwrap();
        cache.set(&key(Granularity::Second), "AAPL", &bars(1), HOUR).unwrap();
        assert_eq!(cache.clear_all().unwrap(), 2);
        assert_eq!(cache.stats().unwrap(), CacheStats::default());
    }

    #[test]
    fn stats_report_ages_and_expiry() {
        let (_dir, cache, clock) = setup();
        cache.set(&key(Granularity::Minute), "AAPL", &bars(5), HOUR).unwrap();
        clock.advance(Duration::from_secs(600));
        cache.set(&key(Granularity::Second), "AAPL", &bars(5), HOUR * 24).unwrap();
        clock.advance(HOUR);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.expired_count, 1);
        assert_eq!(stats.oldest_age_secs, Some(4200));
        assert_eq!(stats.newest_age_secs, Some(3600));
        assert!(stats.total_bytes > 0);
        assert_eq!(stats.by_granularity.get(&Granularity::Minute), Some(&2));
    }

    #[test]
    fn concurrent_writers_of_one_key_leave_a_readable_entry() {
        let (_dir, cache, _clock) = setup();
        let k = key(Granularity::Minute);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10 {
                        cache.set(&k, "AAPL", &bars(50), HOUR).unwrap();
                        assert!(matches!(
                            cache.get(&k),
                            CacheLookup::Hit(_) | CacheLookup::Miss(MissReason::NotFound)
                        ));
                    }
                });
            }
        });
        assert!(cache.get(&k).is_hit());
    }
}
