//! Client-side heartbeat driver
//!
//! Keeps a registered service alive by presenting its current token at a
//! fraction of the heartbeat timeout:
//! - 60% of the timeout below 15 seconds
//! - 80% of the timeout otherwise
//!
//! Each wait is shortened by up to 10% jitter. `NotFound` ends the loop since
//! the service has been timed out or removed; other errors are retried after
//! a short pause.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_common::Token;

use crate::context::AccountContext;
use crate::error::Result;
use crate::registry::Registry;

const SHORT_TIMEOUT_SECS: u32 = 15;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where heartbeats are sent
#[async_trait]
pub trait HeartbeatTarget: Send + Sync {
    async fn heartbeat(&self, service_id: &str, token: Token) -> Result<Token>;
}

/// Heartbeats straight into a registry on behalf of one account
pub struct RegistryTarget {
    registry: Arc<Registry>,
    ctx: AccountContext,
}

impl RegistryTarget {
    pub fn new(registry: Arc<Registry>, ctx: AccountContext) -> Self {
        Self { registry, ctx }
    }
}

#[async_trait]
impl HeartbeatTarget for RegistryTarget {
    async fn heartbeat(&self, service_id: &str, token: Token) -> Result<Token> {
        self.registry.heartbeat(&self.ctx, service_id, token).await
    }
}

/// Base heartbeat interval for a timeout in seconds
pub fn heartbeat_interval(timeout_secs: u32) -> Duration {
    let factor = if timeout_secs < SHORT_TIMEOUT_SECS {
        0.6
    } else {
        0.8
    };
    Duration::from_secs(u64::from(timeout_secs)).mul_f64(factor)
}

fn jittered(interval: Duration) -> Duration {
    let max_jitter = u64::try_from(interval.as_millis() / 10).unwrap_or(0);
    interval.saturating_sub(Duration::from_millis(
        rand::rng().random_range(0..=max_jitter),
    ))
}

/// Why a heartbeater stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Running,
    /// The registry no longer knows the service
    Lost,
    Stopped,
}

pub struct Heartbeater {
    target: Arc<dyn HeartbeatTarget>,
    service_id: String,
    token: Token,
    interval: Duration,
}

impl Heartbeater {
    pub fn new(
        target: Arc<dyn HeartbeatTarget>,
        service_id: impl Into<String>,
        token: Token,
        timeout_secs: u32,
    ) -> Self {
        Self {
            target,
            service_id: service_id.into(),
            token,
            interval: heartbeat_interval(timeout_secs),
        }
    }

    /// Spawn the heartbeat loop
    pub fn start(self) -> HeartbeaterHandle {
        let (status_tx, status_rx) = watch::channel(HeartbeatStatus::Running);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let token = Arc::new(Mutex::new(self.token));
        let beats = Arc::new(AtomicU64::new(0));

        let current = token.clone();
        let count = beats.clone();
        let task = tokio::spawn(async move {
            let mut wait = jittered(self.interval);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        let _ = status_tx.send(HeartbeatStatus::Stopped);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                let presented = *current.lock();
                match self.target.heartbeat(&self.service_id, presented).await {
                    Ok(next) => {
                        *current.lock() = next;
                        count.fetch_add(1, Ordering::Relaxed);
                        wait = jittered(self.interval);
                    }
                    Err(e) if e.is_not_found() => {
                        info!(service_id = %self.service_id, "Service lost, heartbeats stopped");
                        let _ = status_tx.send(HeartbeatStatus::Lost);
                        return;
                    }
                    Err(e) => {
                        warn!(service_id = %self.service_id, error = %e, "Heartbeat failed, retrying");
                        wait = RETRY_DELAY;
                    }
                }
            }
        });

        HeartbeaterHandle {
            token,
            beats,
            status: status_rx,
            stop: stop_tx,
            task,
        }
    }
}

pub struct HeartbeaterHandle {
    token: Arc<Mutex<Token>>,
    beats: Arc<AtomicU64>,
    status: watch::Receiver<HeartbeatStatus>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeaterHandle {
    /// Token to present on the next heartbeat
    pub fn token(&self) -> Token {
        *self.token.lock()
    }

    /// Heartbeats accepted so far
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> HeartbeatStatus {
        *self.status.borrow()
    }

    /// Wait until the loop ends on its own or is stopped
    pub async fn finished(&mut self) -> HeartbeatStatus {
        let _ = self
            .status
            .wait_for(|s| *s != HeartbeatStatus::Running)
            .await;
        self.status()
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Heartbeaters of every service this process keeps alive, keyed by account and service
#[derive(Default)]
pub struct HeartbeaterManager {
    running: DashMap<(String, String), HeartbeaterHandle>,
}

impl HeartbeaterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start heartbeating a service, replacing an earlier heartbeater for it
    pub fn start(&self, account_id: &str, heartbeater: Heartbeater) {
        let key = (account_id.to_string(), heartbeater.service_id.clone());
        debug!(account_id, service_id = %key.1, "Starting heartbeater");
        if let Some(previous) = self.running.insert(key, heartbeater.start()) {
            let _ = previous.stop.send(true);
        }
    }

    pub async fn stop(&self, account_id: &str, service_id: &str) -> bool {
        match self
            .running
            .remove(&(account_id.to_string(), service_id.to_string()))
        {
            Some((_, handle)) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn token(&self, account_id: &str, service_id: &str) -> Option<Token> {
        self.running
            .get(&(account_id.to_string(), service_id.to_string()))
            .map(|h| h.token())
    }

    /// Forget heartbeaters whose service was lost; returns how many were removed
    pub fn prune(&self) -> usize {
        let before = self.running.len();
        self.running
            .retain(|_, handle| handle.status() == HeartbeatStatus::Running);
        before - self.running.len()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub async fn stop_all(&self) {
        let keys: Vec<_> = self.running.iter().map(|e| e.key().clone()).collect();
        for (account_id, service_id) in keys {
            self.stop(&account_id, &service_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use std::sync::atomic::AtomicUsize;

    struct CountingTarget {
        calls: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl HeartbeatTarget for CountingTarget {
        async fn heartbeat(&self, service_id: &str, token: Token) -> Result<Token> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(RegistryError::not_found("service", service_id));
            }
            Ok(Token::new(token.timestamp_millis() + 1_000))
        }
    }

    #[test]
    fn test_interval_policy() {
        assert_eq!(heartbeat_interval(10), Duration::from_secs(6));
        assert_eq!(heartbeat_interval(30), Duration::from_secs(24));
        assert_eq!(heartbeat_interval(15), Duration::from_secs(12));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..50 {
            let d = jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(9) && d <= Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_service_lost() {
        let target = Arc::new(CountingTarget {
            calls: AtomicUsize::new(0),
            fail_after: 3,
        });
        let start = Token::new(1_000);
        let mut handle = Heartbeater::new(target.clone(), "api", start, 5).start();

        assert_eq!(handle.finished().await, HeartbeatStatus::Lost);
        assert_eq!(handle.beats(), 3);
        assert_eq!(target.calls.load(Ordering::SeqCst), 4);
        assert_eq!(handle.token().timestamp_millis(), 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_stop() {
        let manager = HeartbeaterManager::new();
        let target = Arc::new(CountingTarget {
            calls: AtomicUsize::new(0),
            fail_after: usize::MAX,
        });
        manager.start("acc", Heartbeater::new(target, "api", Token::new(0), 30));
        assert_eq!(manager.len(), 1);
        assert!(manager.token("acc", "api").is_some());

        assert!(manager.stop("acc", "api").await);
        assert!(!manager.stop("acc", "api").await);
        assert!(manager.is_empty());
    }
}
