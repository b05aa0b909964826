//! Eager expiry: a background task that purges expired keys on an interval.
//!
//! Lazy expiry already hides dead keys from every read; the sweeper only
//! reclaims their rows. It owns its shutdown signal and never holds the
//! engine lock longer than one batch.

use std::sync::Arc;
use std::time::Duration;

use stowage_core::StateBackend;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handle to a running sweeper task
pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime
    pub fn spawn(backend: Arc<dyn StateBackend>, interval: Duration, batch_size: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweep_loop(backend, interval, batch_size, shutdown_rx));
        info!(?interval, batch_size, "expiry sweeper started");
        Self {
            handle: Some(handle),
            shutdown_tx,
        }
    }

    /// Signal the loop and wait for it to finish its current batch
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("expiry sweeper panicked: {}", e);
                }
            }
        }
        info!("expiry sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_sweep_loop(
    backend: Arc<dyn StateBackend>,
    interval: Duration,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so opening a store stays cheap.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match backend.purge_expired(batch_size).await {
                    Ok(0) => debug!("expiry sweep found nothing"),
                    Ok(removed) => info!(removed, "expiry sweep purged keys"),
                    Err(e) => error!("expiry sweep failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::EmbeddedBackend;
    use stowage_core::EmbeddedConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweeper_purges_and_stops() {
        let tmp = TempDir::new().unwrap();
        let config = EmbeddedConfig {
            path: tmp.path().join("state.db"),
            ..EmbeddedConfig::default()
        };
        let store = EmbeddedBackend::open(&config).unwrap();
        let backend: Arc<dyn StateBackend> = Arc::new(store.clone());

        store
            .set("temp", b"gone", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set("keep", b"stay", None).await.unwrap();

        let sweeper = Sweeper::spawn(backend, Duration::from_millis(30), 10);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(sweeper.is_running());

        // purged eagerly: nothing left for a manual pass
        assert_eq!(store.purge_expired(10).await.unwrap(), 0);
        assert!(store.exists("keep").await.unwrap());

        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let tmp = TempDir::new().unwrap();
        let config = EmbeddedConfig {
            path: tmp.path().join("state.db"),
            ..EmbeddedConfig::default()
        };
        let backend: Arc<dyn StateBackend> = Arc::new(EmbeddedBackend::open(&config).unwrap());

        let sweeper = Sweeper::spawn(backend.clone(), Duration::from_secs(3600), 10);
        drop(sweeper);
        tokio::task::yield_now().await;

        // the aborted task released its clone of the backend
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(Arc::strong_count(&backend), 1);
    }
}
