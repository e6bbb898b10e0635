//! Connectivity observation: polls reachability and nudges the engine when
//! the network comes back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::remote::FormsRemote;

use super::engine::{SyncEngine, SyncReport};
use super::status::SyncStatus;

/// Answers "can we reach the server right now?".
pub trait ConnectivityProbe {
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Probe backed by a cheap HEAD request against the server.
///
/// Any HTTP response counts as online, including error statuses: a 500 still
/// proves the network path exists, and sync runs report delivery failures on
/// their own terms.
#[derive(Clone)]
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl ConnectivityProbe for HttpConnectivityProbe {
    async fn check(&self) -> bool {
        self.client
            .head(&self.url)
            .timeout(Self::PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }
}

/// Notifications emitted by the observer loop.
#[derive(Debug)]
pub enum ObserverEvent {
    /// First probe completed; carries the initial queue state
    Started(SyncStatus),
    Online,
    Offline,
    /// A connectivity-triggered sync run finished
    SyncCompleted(SyncReport),
}

/// Control surface for a running observer.
pub struct ObserverHandle {
    shutdown_tx: mpsc::Sender<()>,
    status_rx: watch::Receiver<bool>,
    /// Stream of observer notifications, in order
    pub events: mpsc::Receiver<ObserverEvent>,
}

impl ObserverHandle {
    /// Latest connectivity verdict without waiting for an event
    pub fn is_online(&self) -> bool {
        *self.status_rx.borrow()
    }

    /// Stop the observer loop. Safe to call after the loop already exited.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Periodically probes connectivity and triggers a sync run on each
/// offline-to-online transition. Startup never syncs on its own: the first
/// probe only establishes the baseline.
pub struct ConnectivityObserver<R, P> {
    engine: Arc<SyncEngine<R>>,
    probe: P,
    poll_interval: Duration,
}

impl<R, P> ConnectivityObserver<R, P>
where
    R: FormsRemote + Send + Sync + 'static,
    P: ConnectivityProbe + Send + Sync + 'static,
{
    pub const fn new(engine: Arc<SyncEngine<R>>, probe: P, poll_interval: Duration) -> Self {
        Self {
            engine,
            probe,
            poll_interval,
        }
    }

    /// Spawn the observer loop and hand back its control handle.
    pub fn start(self) -> ObserverHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(32);

        tokio::spawn(self.observe_loop(shutdown_rx, status_tx, events_tx));

        ObserverHandle {
            shutdown_tx,
            status_rx,
            events: events_rx,
        }
    }

    async fn observe_loop(
        self,
        mut shutdown_rx: mpsc::Receiver<()>,
        status_tx: watch::Sender<bool>,
        events_tx: mpsc::Sender<ObserverEvent>,
    ) {
        let mut online = self.probe.check().await;
        self.engine.set_online(online);
        let _ = status_tx.send(online);
        tracing::debug!(online, "connectivity observer started");

        if let Ok(status) = self.engine.status().await {
            let _ = events_tx.send(ObserverEvent::Started(status)).await;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.recv() => break,
            }

            let now_online = self.probe.check().await;
            if now_online == online {
                continue;
            }
            online = now_online;
            self.engine.set_online(online);
            let _ = status_tx.send(online);

            if online {
                tracing::info!("connectivity restored, triggering sync");
                let _ = events_tx.send(ObserverEvent::Online).await;
                match self.engine.sync().await {
                    Ok(report) => {
                        let _ = events_tx.send(ObserverEvent::SyncCompleted(report)).await;
                    }
                    Err(error) => {
                        tracing::error!(%error, "connectivity-triggered sync failed");
                    }
                }
            } else {
                tracing::info!("connectivity lost");
                let _ = events_tx.send(ObserverEvent::Offline).await;
            }
        }

        tracing::debug!("connectivity observer stopped");
    }
}
