//! Background timers for the audit trail: periodic flush and log expiry.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditSettings, AuditTrail},
    error::{TpsError, TpsResult},
    fs_utils,
};

/// Upper bound on a single expiry sleep; the remaining wait is recomputed on
/// every wake.
pub const MAX_EXPIRY_SLEEP: Duration = Duration::from_secs(6 * 60 * 60);
const MIN_EXPIRY_SLEEP: Duration = Duration::from_secs(1);

pub struct FlushScheduler {
    trail: Arc<AuditTrail>,
}

impl FlushScheduler {
    pub fn new(trail: Arc<AuditTrail>) -> Self {
        Self { trail }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Flush buffered records every interval. Returns once the interval is
    /// set to zero, including when that happens mid-sleep.
    pub async fn run(self) {
        let mut interval_rx = self.trail.subscribe_interval();
        loop {
            let interval = *interval_rx.borrow_and_update();
            if interval.is_zero() {
                debug!("audit flush timer stopped");
                return;
            }
            tokio::select! {
                _ = time::sleep(interval) => {}
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }
            let trail = Arc::clone(&self.trail);
            match tokio::task::spawn_blocking(move || trail.flush_if_pending()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "scheduled audit flush failed"),
                Err(err) => error!(error = %err, "audit flush task join"),
            }
        }
    }
}

/// Deletes rotated audit files once they are older than the expiration time.
pub struct LogExpiry {
    path: PathBuf,
    expiration: watch::Sender<Duration>,
}

impl LogExpiry {
    pub fn new(path: impl Into<PathBuf>, expiration: Duration) -> Self {
        let (expiration, _) = watch::channel(expiration);
        Self {
            path: path.into(),
            expiration,
        }
    }

    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self::new(&settings.file_name, settings.expiration)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Zero disables expiry and stops a running task.
    pub fn set_expiration(&self, seconds: u64) {
        self.expiration.send_replace(Duration::from_secs(seconds));
    }

    pub fn expiration(&self) -> Duration {
        *self.expiration.borrow()
    }

    pub fn purge_expired(&self, now: SystemTime) -> TpsResult<Vec<PathBuf>> {
        let expiration = self.expiration();
        if expiration.is_zero() {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for (path, modified) in fs_utils::rotated_siblings(&self.path).map_err(TpsError::sink)? {
            let age = now.duration_since(modified).unwrap_or_default();
            if age < expiration {
                continue;
            }
            std::fs::remove_file(&path).map_err(TpsError::sink)?;
            info!(path = %path.display(), "expired audit log removed");
            removed.push(path);
        }
        Ok(removed)
    }

    /// Time until the oldest remaining rotated file expires, capped.
    pub fn next_wait(&self, now: SystemTime) -> TpsResult<Duration> {
        let expiration = self.expiration();
        let siblings = fs_utils::rotated_siblings(&self.path).map_err(TpsError::sink)?;
        let wait = siblings
            .first()
            .map(|(_, modified)| {
                let age = now.duration_since(*modified).unwrap_or_default();
                expiration.saturating_sub(age)
            })
            .unwrap_or(MAX_EXPIRY_SLEEP);
        Ok(wait.clamp(MIN_EXPIRY_SLEEP, MAX_EXPIRY_SLEEP))
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self: Arc<Self>) {
        let mut expiration_rx = self.expiration.subscribe();
        loop {
            if expiration_rx.borrow_and_update().is_zero() {
                debug!("audit log expiry stopped");
                return;
            }
            let this = Arc::clone(&self);
            let wait = tokio::task::spawn_blocking(move || {
                let now = SystemTime::now();
                this.purge_expired(now)?;
                this.next_wait(now)
            })
            .await;
            let wait = match wait {
                Ok(Ok(wait)) => wait,
                Ok(Err(err)) => {
                    warn!(error = %err, "audit log expiry sweep failed");
                    MAX_EXPIRY_SLEEP
                }
                Err(err) => {
                    error!(error = %err, "audit expiry task join");
                    MAX_EXPIRY_SLEEP
                }
            };
            tokio::select! {
                _ = time::sleep(wait) => {}
                changed = expiration_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Running background timers, stopped together before the trail closes.
pub struct BackgroundTasks {
    trail: Arc<AuditTrail>,
    expiry: Option<Arc<LogExpiry>>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(trail: Arc<AuditTrail>, expiry: Option<Arc<LogExpiry>>) -> Self {
        let mut handles = vec![FlushScheduler::new(Arc::clone(&trail)).spawn()];
        if let Some(expiry) = &expiry {
            handles.push(Arc::clone(expiry).spawn());
        }
        Self {
            trail,
            expiry,
            handles,
        }
    }

    /// Zero every interval, wait for the tasks to exit, then close the trail.
    pub async fn shutdown(self) -> TpsResult<()> {
        self.trail.set_flush_interval(0);
        if let Some(expiry) = &self.expiry {
            expiry.set_expiration(0);
        }
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        let trail = self.trail;
        tokio::task::spawn_blocking(move || trail.close())
            .await
            .map_err(TpsError::sink)?
    }
}
