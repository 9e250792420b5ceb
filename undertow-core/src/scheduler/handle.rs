//! Public control surface of the scheduler.

use std::time::Duration;

use tokio::sync::oneshot;

use super::events::{EventQueue, SchedulerEvent};
use super::registry::BlacklistEntry;
use super::{SchedulerStats, TorrentStat};
use crate::config::SchedulerConfig;
use crate::torrent::InfoHash;
use crate::{Result, SchedulerError};

/// Cloneable handle to a running scheduler.
///
/// Every method enqueues a typed event and resolves once the loop has
/// handled it; none of them touch scheduler state directly.
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: EventQueue,
    stop_timeout: Duration,
}

/// Pending completion of an [`SchedulerHandle::add_torrent`] call.
///
/// Dropping the watch abandons the waiter without affecting the download;
/// the torrent keeps running for the remaining waiters (or none).
pub struct AddTorrentWatch {
    rx: oneshot::Receiver<Result<()>>,
}

impl AddTorrentWatch {
    /// Waits for the torrent to complete, fail or be removed.
    ///
    /// # Errors
    /// - [`SchedulerError::TorrentNotFound`] - metainfo could not be resolved
    /// - [`SchedulerError::TorrentTimeout`] - leecher TTI elapsed first
    /// - [`SchedulerError::TorrentRemoved`] - removed mid-download
    /// - [`SchedulerError::ShuttingDown`] - scheduler stopped first
    pub async fn wait(self) -> Result<()> {
        self.rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }
}

impl SchedulerHandle {
    pub(crate) fn new(queue: EventQueue, stop_timeout: Duration) -> Self {
        Self {
            queue,
            stop_timeout,
        }
    }

    /// Starts (or joins) the download of `info_hash` and returns a watch
    /// for its completion.
    ///
    /// Concurrent calls for the same torrent share one outcome: every
    /// watch resolves the same way. Once the torrent seeds, new calls
    /// resolve `Ok` immediately without network traffic.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the scheduler has
    /// stopped.
    pub async fn add_torrent(
        &self,
        namespace: &str,
        info_hash: InfoHash,
    ) -> Result<AddTorrentWatch> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::AddTorrent {
            namespace: namespace.to_owned(),
            info_hash,
            responder,
        })
        .await?;
        Ok(AddTorrentWatch { rx })
    }

    /// Evicts a torrent: outstanding waiters fail with
    /// [`SchedulerError::TorrentRemoved`], conns drop and the archive
    /// entry is deleted.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the scheduler has
    /// stopped.
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::RemoveTorrent {
            info_hash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    /// Returns the status, progress and conn count of one torrent.
    ///
    /// # Errors
    /// - [`SchedulerError::TorrentNotFound`] - torrent not in the scheduler
    /// - [`SchedulerError::ShuttingDown`] - scheduler stopped
    pub async fn stat(&self, info_hash: InfoHash) -> Result<TorrentStat> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::Stat {
            info_hash,
            responder,
        })
        .await?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)?
    }

    /// Returns aggregate scheduler counters.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the scheduler has
    /// stopped.
    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::Stats { responder }).await?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Checks that the event loop is alive and draining its queue.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the scheduler has
    /// stopped.
    pub async fn probe(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::Probe { responder }).await?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Returns the live blacklist entries.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the scheduler has
    /// stopped.
    pub async fn blacklist_snapshot(&self) -> Result<Vec<BlacklistEntry>> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::BlacklistSnapshot { responder })
            .await?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Swaps the scheduler configuration in place. Live torrents and
    /// conns, including in-flight piece requests, carry over; timers pick
    /// up the new durations as they re-arm.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the scheduler has
    /// stopped.
    pub async fn reload(&self, config: SchedulerConfig) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::Reload {
            config: Box::new(config),
            responder,
        })
        .await?;
        rx.await.map_err(|_| SchedulerError::ShuttingDown)
    }

    /// Stops the scheduler: waiters resolve with
    /// [`SchedulerError::ShuttingDown`], conns close, the loop exits.
    /// Waits up to the configured stop timeout for the drain.
    ///
    /// # Errors
    /// Returns [`SchedulerError::ShuttingDown`] if the loop was already
    /// gone.
    pub async fn stop(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.post(SchedulerEvent::Stop { responder }).await?;
        match tokio::time::timeout(self.stop_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SchedulerError::ShuttingDown),
            Err(_elapsed) => {
                // Drain overran its grace period; the queue is closed, so
                // the loop dies with its next dequeue either way.
                self.queue.close();
                Ok(())
            }
        }
    }

    async fn post(&self, event: SchedulerEvent) -> Result<()> {
        self.queue
            .post(event)
            .await
            .map_err(|_| SchedulerError::ShuttingDown)
    }
}
