//! Per-`(user_id, game_id)` mutual exclusion for game-state mutation,
//! grounded on `original_source/game_state_lock_manager.py`
//! (`GameStateLockManager`/`GameStateLock`): one `tokio::sync::Mutex` per
//! game, a manager-level mutex guarding the registry itself, wait/hold-time
//! bookkeeping, a 100ms wait-time warning threshold, and idle-lock cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};

const WAIT_WARN_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct LockMetrics {
    pub access_count: u64,
    pub last_wait_ms: u64,
    pub last_hold_ms: u64,
}

struct GameStateLock {
    mutex: Arc<Mutex<()>>,
    last_access: std::sync::Mutex<Instant>,
    metrics: std::sync::Mutex<LockMetrics>,
}

impl GameStateLock {
    fn new(now: Instant) -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            last_access: std::sync::Mutex::new(now),
            metrics: std::sync::Mutex::new(LockMetrics::default()),
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_access.lock().unwrap())
    }
}

/// RAII guard returned by `lock_game_state`; releasing it (drop) records the
/// hold time the same way the original's `finally: lock.release()` does.
pub struct GameStateGuard {
    _inner: OwnedMutexGuard<()>,
    lock: Arc<GameStateLock>,
    operation: String,
    acquired_at: Instant,
}

impl Drop for GameStateGuard {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis() as u64;
        let mut metrics = self.lock.metrics.lock().unwrap();
        metrics.last_hold_ms = hold_ms;
        log::debug!("lock released for operation {} hold_ms={hold_ms}", self.operation);
    }
}

#[derive(Default)]
pub struct GameStateLockManager {
    locks: Mutex<HashMap<(String, String), Arc<GameStateLock>>>,
}

impl GameStateLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create_lock(&self, key: &(String, String)) -> Arc<GameStateLock> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(GameStateLock::new(Instant::now())))
            .clone()
    }

    /// Acquires the per-game lock, logging a warning if the wait exceeded
    /// 100ms. The returned guard releases (and records hold time) on drop.
    pub async fn lock_game_state(&self, user_id: &str, game_id: &str, operation: &str) -> GameStateGuard {
        let key = (user_id.to_string(), game_id.to_string());
        let lock = self.get_or_create_lock(&key).await;

        let wait_start = Instant::now();
        let inner = lock.mutex.clone().lock_owned().await;
        let wait_ms = wait_start.elapsed().as_millis() as u64;
        if wait_start.elapsed() > WAIT_WARN_THRESHOLD {
            log::warn!("lock wait time for ({user_id}, {game_id}) ({operation}): {wait_ms}ms");
        }

        {
            let mut metrics = lock.metrics.lock().unwrap();
            metrics.access_count += 1;
            metrics.last_wait_ms = wait_ms;
        }
        *lock.last_access.lock().unwrap() = Instant::now();

        GameStateGuard {
            _inner: inner,
            lock,
            operation: operation.to_string(),
            acquired_at: Instant::now(),
        }
    }

    /// Removes locks idle (unlocked, no access) for longer than `timeout`.
    /// Mirrors `cleanup_unused_locks`'s default 3600s in the original.
    pub async fn cleanup_unused_locks(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        let stale: Vec<(String, String)> = locks
            .iter()
            .filter(|(_, lock)| lock.mutex.try_lock().is_ok() && lock.idle_for(now) > timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            locks.remove(key);
            log::info!("cleaned up unused lock for game {key:?}");
        }
        stale.len()
    }

    pub async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Removes a game's lock outright (called when a game session ends).
    pub async fn remove_lock(&self, user_id: &str, game_id: &str) {
        let key = (user_id.to_string(), game_id.to_string());
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.remove(&key) {
            if lock.mutex.try_lock().is_err() {
                log::warn!("removing lock for {key:?} while still locked");
            }
        }
    }
}
