//! Filesystem-backed signal bus
//!
//! Signals are JSON files under `<root>/outgoing/`, written to a temp name
//! and renamed in (atomic on one filesystem). Filenames are monotonic
//! (millisecond timestamp + sequence + id prefix) so lexicographic order is
//! emission order. A consumer takes a signal by renaming it into
//! `<root>/processed/` BEFORE processing: a crash leaves the file either in
//! `outgoing/` (redelivered on next boot) or `processed/` (done, never
//! redelivered).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::SignalBus;
use crate::errors::EngineError;
use crate::types::Signal;

const OUTGOING: &str = "outgoing";
const PROCESSED: &str = "processed";

pub struct FsBus {
    outgoing: PathBuf,
    processed: PathBuf,
    seq: AtomicU64,
}

impl FsBus {
    /// Open (and create) the directory pair. Both live under one root so
    /// they share a filesystem and renames stay atomic.
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        let outgoing = root.join(OUTGOING);
        let processed = root.join(PROCESSED);
        std::fs::create_dir_all(&outgoing)
            .map_err(|e| EngineError::BusUnavailable(format!("create {}: {e}", outgoing.display())))?;
        std::fs::create_dir_all(&processed)
            .map_err(|e| EngineError::BusUnavailable(format!("create {}: {e}", processed.display())))?;
        Ok(Self {
            outgoing,
            processed,
            seq: AtomicU64::new(0),
        })
    }

    /// Monotonic, collision-free filename: zero-padded millis + per-process
    /// sequence + signal id prefix.
    fn filename(&self, signal: &Signal) -> String {
        let millis = signal.created_at.timestamp_millis().max(0) as u64;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = signal.id.simple().to_string();
        format!("{millis:013}-{seq:06}-{}.json", &id[..8])
    }

    fn list_outgoing(&self) -> Result<Vec<PathBuf>, EngineError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.outgoing)
            .map_err(|e| EngineError::BusUnavailable(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl SignalBus for FsBus {
    async fn emit(&self, signal: &Signal) -> Result<(), EngineError> {
        let json = signal.to_json()?;
        let name = self.filename(signal);
        let tmp = self.outgoing.join(format!(".tmp-{name}"));
        let target = self.outgoing.join(&name);

        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| EngineError::BusUnavailable(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| EngineError::BusUnavailable(format!("rename into outgoing: {e}")))?;
        debug!(file = %target.display(), "signal written");
        Ok(())
    }

    async fn consume(&self) -> Result<Option<Signal>, EngineError> {
        // Oldest first; also how crash recovery replays leftovers.
        for path in self.list_outgoing()? {
            let Some(name) = path.file_name() else { continue };
            let taken = self.processed.join(name);

            // Atomic take: after this rename the signal can never be
            // delivered again, even if we crash before returning it.
            match tokio::fs::rename(&path, &taken).await {
                Ok(()) => {}
                Err(_) => {
                    // Raced with another consumer or the file vanished.
                    continue;
                }
            }

            let raw = tokio::fs::read_to_string(&taken)
                .await
                .map_err(|e| EngineError::BusUnavailable(format!("read taken signal: {e}")))?;
            match Signal::from_json(&raw) {
                Ok(signal) => return Ok(Some(signal)),
                Err(err) => {
                    // Malformed or wrong version: already in processed/, so
                    // it stays quarantined there.
                    warn!(file = %taken.display(), %err, "dropping undecodable signal");
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    async fn probe(&self) -> Result<(), EngineError> {
        tokio::fs::metadata(&self.outgoing)
            .await
            .map_err(|e| EngineError::BusUnavailable(e.to_string()))?;
        tokio::fs::metadata(&self.processed)
            .await
            .map_err(|e| EngineError::BusUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fixtures;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bus(root: &Path) -> FsBus {
        FsBus::open(root).unwrap()
    }

    fn signal() -> Signal {
        fixtures::signal(dec!(20), dec!(5), Utc::now())
    }

    #[tokio::test]
    async fn emit_then_consume_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let sent = signal();
        bus.emit(&sent).await.unwrap();

        let got = bus.consume().await.unwrap().unwrap();
        assert_eq!(got, sent);
        assert!(bus.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let first = signal();
        let second = signal();
        let third = signal();
        bus.emit(&first).await.unwrap();
        bus.emit(&second).await.unwrap();
        bus.emit(&third).await.unwrap();

        assert_eq!(bus.consume().await.unwrap().unwrap().id, first.id);
        assert_eq!(bus.consume().await.unwrap().unwrap().id, second.id);
        assert_eq!(bus.consume().await.unwrap().unwrap().id, third.id);
    }

    /// Crash scenario: consumer dies after taking s1 into processed/, a new
    /// consumer starts over the same directories. s2 and s3 are consumed
    /// exactly once; s1 is never reprocessed.
    #[tokio::test]
    async fn crash_between_take_and_process_never_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let signals = [signal(), signal(), signal()];
        {
            let bus = bus(dir.path());
            for s in &signals {
                bus.emit(s).await.unwrap();
            }
            // Consumer takes s1 and "crashes" here (bus dropped).
            let taken = bus.consume().await.unwrap().unwrap();
            assert_eq!(taken.id, signals[0].id);
        }

        let restarted = bus(dir.path());
        let a = restarted.consume().await.unwrap().unwrap();
        let b = restarted.consume().await.unwrap().unwrap();
        assert_eq!(a.id, signals[1].id);
        assert_eq!(b.id, signals[2].id);
        assert!(restarted.consume().await.unwrap().is_none());
    }

    /// After any sequence of emits and consumes, every signal lives in
    /// exactly one of the two directories.
    #[tokio::test]
    async fn union_of_directories_holds_each_signal_once() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        for _ in 0..5 {
            bus.emit(&signal()).await.unwrap();
        }
        bus.consume().await.unwrap().unwrap();
        bus.consume().await.unwrap().unwrap();

        let count = |sub: &str| {
            std::fs::read_dir(dir.path().join(sub))
                .unwrap()
                .filter(|e| {
                    e.as_ref()
                        .unwrap()
                        .path()
                        .extension()
                        .map(|x| x == "json")
                        .unwrap_or(false)
                })
                .count()
        };
        assert_eq!(count(OUTGOING), 3);
        assert_eq!(count(PROCESSED), 2);
    }

    #[tokio::test]
    async fn unsupported_version_file_quarantined_in_processed() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        let mut bad = signal();
        bad.version = 9;
        // Write it raw; Signal::to_json would happily serialize it.
        let raw = serde_json::to_string(&bad).unwrap();
        std::fs::write(dir.path().join(OUTGOING).join("0000000000000-000000-bad.json"), raw)
            .unwrap();

        match bus.consume().await {
            Err(EngineError::UnsupportedVersion(9)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        // The file moved to processed/ and is not redelivered.
        assert!(bus.consume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn probe_fails_when_directories_removed() {
        let dir = tempfile::tempdir().unwrap();
        let bus = bus(dir.path());
        assert!(bus.probe().await.is_ok());
        std::fs::remove_dir_all(dir.path().join(OUTGOING)).unwrap();
        assert!(bus.probe().await.is_err());
    }
}
