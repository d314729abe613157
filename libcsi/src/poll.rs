//! Waiting for the cloud API to converge.
//!
//! The remote API is eventually consistent: a create returns before the volume
//! is usable and an attach returns before the attachment is visible. Every
//! wait goes through [`Poller`], which polls at a fixed interval, gives up
//! after an overall timeout and stops early when the driver shuts down.
//!
//! Timing uses `tokio::time`, so tests drive it with a paused runtime clock
//! instead of sleeping.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::cloud::{CloudClient, RemoteVolume, VolumeStatus};
use crate::error::CsiError;

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default overall wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// Bounded, cancellable polling loop.
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Poller {
    /// Create a poller that aborts once `shutdown` flips to `true`.
    pub fn new(interval: Duration, timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            interval,
            timeout,
            shutdown: Some(shutdown),
        }
    }

    /// A poller that is never cancelled.
    pub fn detached(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            shutdown: None,
        }
    }

    /// Call `probe` until it yields `Some`, the timeout expires, or the driver
    /// shuts down.
    ///
    /// `action` and `volume_id` only feed error messages and logs.
    pub async fn until<T, F, Fut>(
        &self,
        action: &str,
        volume_id: u64,
        mut probe: F,
    ) -> Result<T, CsiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, CsiError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut shutdown = self.shutdown.clone();
        loop {
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                return Err(Self::cancelled(action, volume_id));
            }
            if let Some(value) = probe().await? {
                return Ok(value);
            }
            if Instant::now() + self.interval > deadline {
                return Err(CsiError::Timeout {
                    action: action.to_owned(),
                    volume_id,
                });
            }
            debug!(action, volume_id, "remote state not converged yet");
            match shutdown.as_mut() {
                Some(rx) => tokio::select! {
                    () = sleep(self.interval) => {}
                    changed = rx.changed() => {
                        // A dropped sender means the driver is going away.
                        if changed.is_err() || *rx.borrow() {
                            return Err(Self::cancelled(action, volume_id));
                        }
                    }
                },
                None => sleep(self.interval).await,
            }
        }
    }

    fn cancelled(action: &str, volume_id: u64) -> CsiError {
        CsiError::Unavailable(format!(
            "wait for {action} on volume {volume_id} cancelled by shutdown"
        ))
    }
}

/// Wait until the volume reports `status`.
pub async fn wait_for_volume_status(
    poller: &Poller,
    client: &dyn CloudClient,
    volume_id: u64,
    status: VolumeStatus,
) -> Result<RemoteVolume, CsiError> {
    let action = format!("status {status:?}");
    poller
        .until(&action, volume_id, move || {
            let status = status.clone();
            async move {
                let volume = client.get_volume(volume_id).await?;
                Ok((volume.status == status).then_some(volume))
            }
        })
        .await
}

/// Wait until the volume's attachment equals `instance_id` (`None` waits for a
/// detach).
pub async fn wait_for_volume_instance(
    poller: &Poller,
    client: &dyn CloudClient,
    volume_id: u64,
    instance_id: Option<u64>,
) -> Result<RemoteVolume, CsiError> {
    let action = match instance_id {
        Some(id) => format!("attachment to instance {id}"),
        None => "detachment".to_owned(),
    };
    poller
        .until(&action, volume_id, move || async move {
            let volume = client.get_volume(volume_id).await?;
            Ok((volume.attached_instance_id == instance_id).then_some(volume))
        })
        .await
}
