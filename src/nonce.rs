// =============================================================================
// Nonce Authority — monotonic nonce issuance with crash-safe persistence
// =============================================================================
//
// Kraken requires every private REST/WS call to carry a nonce strictly
// greater than the previous one accepted for that key. A nonce based purely
// on wall-clock milliseconds is fine until the process restarts close enough
// to a prior call that `now_ms()` could repeat or go backwards (clock skew,
// NTP step). This authority persists the last issued value to disk so a
// restart never reissues a nonce the exchange has already seen.
//
// The floor is guarded by a `tokio::sync::Mutex` rather than `parking_lot`
// because persistence runs as a blocking file write; holding a parking_lot
// lock across that would block the executor thread instead of yielding it.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Nonce jump applied after Kraken reports `EAPI:Invalid nonce`, to clear
/// whatever ordering ambiguity caused the rejection.
const RECOVERY_BUMP_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
struct NonceFile {
    last_issued: i64,
}

struct NonceInner {
    last_issued: i64,
    issued_count: u64,
    recoveries: u64,
    degraded: bool,
}

/// Snapshot of the authority's health, for the orchestrator's heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct NonceStatus {
    pub last_issued: i64,
    pub issued_count: u64,
    pub recoveries: u64,
    /// Set once persistence has failed at least once. The authority keeps
    /// issuing nonces in-memory either way; this only means a crash could
    /// now replay a value the exchange has seen.
    pub degraded: bool,
}

pub struct NonceAuthority {
    inner: Mutex<NonceInner>,
    path: PathBuf,
}

impl NonceAuthority {
    /// Load the persisted floor from `path` if present, otherwise start
    /// from zero (the first real nonce is still clamped to `now_ms()`).
    pub async fn load(path: impl AsRef<Path>) -> Arc<Self> {
        let path = path.as_ref().to_path_buf();

        let last_issued = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<NonceFile>(&content)
                .map(|f| f.last_issued)
                .unwrap_or(0),
            Err(_) => 0,
        };

        Arc::new(Self {
            inner: Mutex::new(NonceInner {
                last_issued,
                issued_count: 0,
                recoveries: 0,
                degraded: false,
            }),
            path,
        })
    }

    /// Issue the next nonce: `max(now_ms, last_issued + 1)`. Persists the
    /// new floor best-effort on a blocking task so the mutex is never held
    /// across file IO.
    pub async fn next_nonce(&self) -> i64 {
        let mut guard = self.inner.lock().await;
        let now = now_ms();
        let candidate = std::cmp::max(now, guard.last_issued + 1);
        guard.last_issued = candidate;
        guard.issued_count += 1;
        let degraded_before = guard.degraded;
        drop(guard);

        self.persist(candidate, degraded_before).await;
        candidate
    }

    /// Called after Kraken rejects a call with `EAPI:Invalid nonce`. Jumps
    /// the floor forward by [`RECOVERY_BUMP_MS`] so the next issued nonce is
    /// unambiguously past whatever the exchange last accepted.
    pub async fn recover_from_invalid(&self) {
        let mut guard = self.inner.lock().await;
        let now = now_ms();
        guard.last_issued = std::cmp::max(guard.last_issued, now) + RECOVERY_BUMP_MS;
        guard.recoveries += 1;
        warn!(new_floor = guard.last_issued, recoveries = guard.recoveries, "nonce floor bumped after invalid-nonce rejection");
        let floor = guard.last_issued;
        let degraded_before = guard.degraded;
        drop(guard);

        self.persist(floor, degraded_before).await;
    }

    pub async fn status(&self) -> NonceStatus {
        let guard = self.inner.lock().await;
        NonceStatus {
            last_issued: guard.last_issued,
            issued_count: guard.issued_count,
            recoveries: guard.recoveries,
            degraded: guard.degraded,
        }
    }

    async fn persist(&self, last_issued: i64, was_degraded: bool) {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || write_atomic(&path, last_issued)).await;

        let failed = matches!(result, Ok(Err(_)) | Err(_));
        if failed && !was_degraded {
            error!("nonce persistence failed, continuing in-memory");
            let mut guard = self.inner.lock().await;
            guard.degraded = true;
        } else if !failed && was_degraded {
            let mut guard = self.inner.lock().await;
            guard.degraded = false;
        }
    }
}

fn write_atomic(path: &Path, last_issued: i64) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string(&NonceFile { last_issued })?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
