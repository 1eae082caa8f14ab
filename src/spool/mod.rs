//! Directory-backed transmission queue shared between threads and
//! processes. Files move through three states: `.tmp` while being written,
//! `.trn` once committed, `.corrupt` once quarantined. Every public
//! operation swallows and logs its errors; losing telemetry is always
//! preferred over surfacing a failure to the host.

pub mod frame;
pub mod fs;

pub use frame::{FrameError, Transmission};
pub use fs::{FileInfo, FileSystem, OsFileSystem};

use crate::clock::{Clock, SystemClock};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TMP_EXTENSION: &str = "tmp";
pub const TRN_EXTENSION: &str = "trn";
pub const CORRUPT_EXTENSION: &str = "corrupt";

const RECENTLY_DELETED_CAP: usize = 10;
const REMOVE_ATTEMPTS: u32 = 3;
const DROP_LOG_EVERY: u64 = 100;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
// Creation times before this (or more than a day in the future) are
// treated as filesystem noise and the filename prefix is used instead.
const MIN_PLAUSIBLE_UNIX_SECS: i64 = 946_684_800; // 2000-01-01T00:00:00Z

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub directory: PathBuf,
    pub capacity_bytes: u64,
    pub max_files: usize,
    pub trn_ttl: Duration,
    pub corrupt_ttl: Duration,
    pub tmp_ttl: Duration,
    pub retry_deadline: Duration,
    pub peek_scan_limit: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("beacon-telemetry"),
            capacity_bytes: 10 * 1024 * 1024,
            max_files: 100,
            trn_ttl: Duration::from_secs(30 * 24 * 3600),
            corrupt_ttl: Duration::from_secs(7 * 24 * 3600),
            tmp_ttl: Duration::from_secs(5 * 60),
            retry_deadline: Duration::from_secs(2 * 3600),
            peek_scan_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Capacity,
    Io,
}

/// A committed transmission currently checked out by the transmitter.
/// Resolve it with [`Spool::delete`] or [`Spool::release`].
#[derive(Debug, Clone)]
pub struct InFlight {
    file_name: String,
    len: u64,
    transmission: Transmission,
}

impl InFlight {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn transmission(&self) -> &Transmission {
        &self.transmission
    }
}

#[derive(Debug, Default)]
struct SpoolState {
    in_flight: HashSet<String>,
    recently_deleted: VecDeque<String>,
    storage_size_bytes: u64,
    file_count: usize,
}

pub struct Spool<F = OsFileSystem, C = SystemClock> {
    config: SpoolConfig,
    fs: F,
    clock: C,
    state: Mutex<SpoolState>,
    dropped: AtomicU64,
}

impl Spool {
    pub async fn open(config: SpoolConfig) -> io::Result<Self> {
        Self::with_parts(config, OsFileSystem, SystemClock).await
    }
}

impl<F: FileSystem, C: Clock> Spool<F, C> {
    pub async fn with_parts(config: SpoolConfig, fs: F, clock: C) -> io::Result<Self> {
        fs.create_dir_all(&config.directory).await?;
        let spool = Self {
            config,
            fs,
            clock,
            state: Mutex::new(SpoolState::default()),
            dropped: AtomicU64::new(0),
        };
        // Startup sweep: clears crash leftovers right away and doubles as
        // the initial counter scan.
        spool.gc().await;
        Ok(spool)
    }

    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// Advisory byte total from the last rescan; drifts under concurrent
    /// multi-process use.
    pub fn storage_size_bytes(&self) -> u64 {
        self.state.lock().storage_size_bytes
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().file_count
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether a transmission has aged past the point of retrying.
    pub fn past_retry_deadline(&self, transmission: &Transmission) -> bool {
        let age = self
            .clock
            .now_utc()
            .signed_duration_since(transmission.created_at_utc());
        age >= chrono_duration(self.config.retry_deadline)
    }

    /// Persists one transmission as a committed `.trn` file.
    ///
    /// Capacity is judged against a fresh directory scan, not the cached
    /// counters. Never fails: anything that goes wrong becomes a
    /// [`DropReason`].
    pub async fn enqueue(&self, transmission: &Transmission) -> EnqueueResult {
        if let Err(e) = self.rescan().await {
            // Fall back to the cached counters.
            debug!(error = %e, "spool.scan.failed");
        }
        let (size, count) = {
            let state = self.state.lock();
            (state.storage_size_bytes, state.file_count)
        };
        if size >= self.config.capacity_bytes || count >= self.config.max_files {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % DROP_LOG_EVERY == 0 {
                info!(dropped, size, count, "enqueue.drop.capacity");
            }
            return EnqueueResult::Dropped(DropReason::Capacity);
        }

        let encoded = frame::encode(transmission);
        let token = Uuid::new_v4().simple().to_string();
        let tmp_path = self.config.directory.join(format!("{token}.{TMP_EXTENSION}"));
        if let Err(e) = self.fs.write(&tmp_path, &encoded).await {
            warn!(error = %e, "enqueue.write.failed");
            let _ = self.fs.remove(&tmp_path).await;
            return EnqueueResult::Dropped(DropReason::Io);
        }

        let stamp = self.clock.now_utc().format(TIMESTAMP_FORMAT);
        let final_name = format!("{stamp}_{token}.{TRN_EXTENSION}");
        let final_path = self.config.directory.join(&final_name);
        if let Err(e) = self.fs.rename(&tmp_path, &final_path).await {
            warn!(error = %e, "enqueue.commit.failed");
            let _ = self.fs.remove(&tmp_path).await;
            return EnqueueResult::Dropped(DropReason::Io);
        }

        {
            let mut state = self.state.lock();
            state.storage_size_bytes += encoded.len() as u64;
            state.file_count += 1;
        }
        debug!(file = %final_name, bytes = encoded.len(), "enqueue.accepted");
        EnqueueResult::Accepted
    }

    /// Checks out the next decodable `.trn` file, freshest first.
    ///
    /// Corrupt files found along the way are quarantined; files deleted by
    /// another process mid-scan are skipped silently.
    pub async fn peek(&self) -> Option<InFlight> {
        let entries = match self.fs.list_files(&self.config.directory).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "spool.scan.failed");
                return None;
            }
        };

        let mut candidates: Vec<(String, u64)> = entries
            .iter()
            .filter(|info| info.extension() == Some(TRN_EXTENSION))
            .filter_map(|info| info.file_name().map(|n| (n.to_string(), info.len)))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.truncate(self.config.peek_scan_limit);

        for (name, len) in candidates {
            {
                let state = self.state.lock();
                if state.in_flight.contains(&name) || state.recently_deleted.contains(&name) {
                    continue;
                }
            }

            let path = self.config.directory.join(&name);
            let bytes = match self.fs.read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(file = %name, error = %e, "peek.read.failed");
                    continue;
                }
            };

            match frame::decode(&bytes) {
                Ok(transmission) => {
                    let claimed = {
                        let mut state = self.state.lock();
                        !state.recently_deleted.contains(&name)
                            && state.in_flight.insert(name.clone())
                    };
                    if !claimed {
                        continue;
                    }
                    return Some(InFlight {
                        file_name: name,
                        len,
                        transmission,
                    });
                }
                Err(e) => {
                    warn!(file = %name, reason = %e, "peek.corrupt");
                    self.quarantine(&name).await;
                }
            }
        }
        None
    }

    /// Removes a checked-out transmission from disk and bookkeeping.
    ///
    /// Idempotent: resolving the same handle twice, or after another
    /// process already removed the file, is harmless.
    pub async fn delete(&self, item: InFlight) {
        let InFlight { file_name, len, .. } = item;
        {
            let mut state = self.state.lock();
            let was_tracked = state.in_flight.remove(&file_name);
            if !was_tracked && state.recently_deleted.contains(&file_name) {
                return;
            }
            state.recently_deleted.push_back(file_name.clone());
            while state.recently_deleted.len() > RECENTLY_DELETED_CAP {
                state.recently_deleted.pop_front();
            }
            state.storage_size_bytes = state.storage_size_bytes.saturating_sub(len);
            state.file_count = state.file_count.saturating_sub(1);
        }

        let path = self.config.directory.join(&file_name);
        if let Err(e) = self.remove_with_retry(&path).await {
            warn!(file = %file_name, error = %e, "delete.failed");
        }
    }

    /// Returns a checked-out transmission to the queue without touching
    /// the file; the next peek may pick it up again.
    pub fn release(&self, item: InFlight) {
        self.state.lock().in_flight.remove(&item.file_name);
    }

    /// Renames a malformed `.trn` aside as `.corrupt` so peek stops
    /// tripping over it. The quarantined file is kept for diagnostics
    /// until its TTL elapses.
    pub async fn quarantine(&self, file_name: &str) {
        let corrupt_name = Path::new(file_name).with_extension(CORRUPT_EXTENSION);
        let src = self.config.directory.join(file_name);
        let dst = self.config.directory.join(&corrupt_name);

        // A previous attempt may have left a stale target behind.
        if let Err(e) = self.remove_with_retry(&dst).await {
            debug!(file = %dst.display(), error = %e, "quarantine.cleanup.failed");
        }
        match self.fs.rename(&src, &dst).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %file_name, error = %e, "quarantine.failed"),
        }
    }

    /// Deletes files whose age exceeds the TTL for their state. Each
    /// failure is logged and skipped; the sweep always finishes.
    pub async fn gc(&self) {
        let now = self.clock.now_utc();
        let entries = match self.fs.list_files(&self.config.directory).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "spool.scan.failed");
                return;
            }
        };

        let mut removed = 0usize;
        for info in &entries {
            let ttl = match info.extension() {
                Some(TMP_EXTENSION) => self.config.tmp_ttl,
                Some(TRN_EXTENSION) => self.config.trn_ttl,
                Some(CORRUPT_EXTENSION) => self.config.corrupt_ttl,
                _ => continue,
            };
            let Some(created) = effective_creation_time(info, now) else {
                continue;
            };
            if now.signed_duration_since(created) <= chrono_duration(ttl) {
                continue;
            }
            match self.remove_with_retry(&info.path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %info.path.display(), error = %e, "gc.delete.failed"),
            }
        }
        if removed > 0 {
            info!(removed, "gc.expired");
        }
        if let Err(e) = self.rescan().await {
            debug!(error = %e, "spool.scan.failed");
        }
    }

    /// Recomputes the advisory counters from the directory contents.
    async fn rescan(&self) -> io::Result<()> {
        let entries = self.fs.list_files(&self.config.directory).await?;
        let mut size = 0u64;
        let mut count = 0usize;
        for info in &entries {
            if matches!(
                info.extension(),
                Some(TMP_EXTENSION) | Some(TRN_EXTENSION) | Some(CORRUPT_EXTENSION)
            ) {
                size += info.len;
                count += 1;
            }
        }
        let mut state = self.state.lock();
        state.storage_size_bytes = size;
        state.file_count = count;
        Ok(())
    }

    /// Removal with a bounded number of back-to-back retries for errors
    /// that tend to clear on their own. Missing files count as removed.
    async fn remove_with_retry(&self, path: &Path) -> io::Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fs.remove(path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) if transient_fs_error(&e) && attempt < REMOVE_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn transient_fs_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy
    )
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Age source for TTL decisions: filesystem creation time when plausible,
/// otherwise the filename's timestamp prefix. Some filesystems report no
/// creation time at all, and clock skew can produce future-dated or
/// epoch-zero values.
fn effective_creation_time(info: &FileInfo, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(created) = info.created_utc {
        let plausible = created.timestamp() >= MIN_PLAUSIBLE_UNIX_SECS
            && created <= now + chrono::Duration::days(1);
        if plausible {
            return Some(created);
        }
    }
    info.file_name().and_then(timestamp_from_name)
}

/// Parses the `YYYYMMDDhhmmss` prefix of a committed filename.
fn timestamp_from_name(name: &str) -> Option<DateTime<Utc>> {
    let prefix = name.split('_').next()?;
    if prefix.len() != 14 {
        return None;
    }
    NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
