//! Pool of pre-started handlers
//!
//! A background task keeps up to `capacity` handlers started and queued so
//! that requests rarely wait for an interpreter to boot. Handlers leave the
//! queue one request at a time and are never returned to it.

use crate::config::PoolConfig;
use crate::error::{error_response, FailureKind, PoolError, ProxyBody};
use crate::handler::{Handler, HandlerSettings};
use crate::process::Launcher;
use hyper::body::Body;
use hyper::{Request, Response};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Statistics for the handler pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Handlers whose backend started successfully
    pub handlers_started: AtomicU64,
    /// Handlers handed out to serve a request
    pub handlers_served: AtomicU64,
    /// Launch attempts that returned an error
    pub launch_failures: AtomicU64,
    /// Queued handlers whose backend died before being handed out
    pub handlers_discarded: AtomicU64,
    /// Handlers currently queued and ready
    pub ready: AtomicUsize,
}

impl PoolStats {
    pub fn get_handlers_started(&self) -> u64 {
        self.handlers_started.load(Ordering::Relaxed)
    }

    pub fn get_handlers_served(&self) -> u64 {
        self.handlers_served.load(Ordering::Relaxed)
    }

    pub fn get_launch_failures(&self) -> u64 {
        self.launch_failures.load(Ordering::Relaxed)
    }

    pub fn get_handlers_discarded(&self) -> u64 {
        self.handlers_discarded.load(Ordering::Relaxed)
    }

    pub fn get_ready(&self) -> usize {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Bounded, self-replenishing supply of ready handlers
pub struct HandlerPool {
    ready: Mutex<mpsc::Receiver<Handler>>,
    shutdown_tx: watch::Sender<bool>,
    replenisher: SyncMutex<Option<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    capacity: usize,
}

impl HandlerPool {
    /// Create the pool and start filling it in the background
    pub fn new(launcher: Launcher, settings: HandlerSettings, config: &PoolConfig) -> Arc<Self> {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(PoolStats::default());

        let replenisher = tokio::spawn(replenish(
            launcher,
            settings,
            tx,
            shutdown_rx,
            Arc::clone(&stats),
            config.retry_backoff(),
        ));

        info!(capacity, "Handler pool started");

        Arc::new(Self {
            ready: Mutex::new(rx),
            shutdown_tx,
            replenisher: SyncMutex::new(Some(replenisher)),
            stats,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the next ready handler whose backend is still running.
    /// Handlers that died in the queue are closed and skipped.
    pub async fn acquire(&self) -> Result<Handler, PoolError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(PoolError::Closed);
        }

        loop {
            let handler = tokio::select! {
                handler = async { self.ready.lock().await.recv().await } => handler,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => None,
            };

            let mut handler = handler.ok_or(PoolError::Closed)?;
            self.stats.ready.fetch_sub(1, Ordering::Relaxed);

            let port = handler.port();
            if let Some(exit) = handler.try_exit() {
                warn!(port = port, status = ?exit.status(), "Discarding handler whose backend exited in the queue");
                self.stats.handlers_discarded.fetch_add(1, Ordering::Relaxed);
                handler.close().await;
                continue;
            }

            self.stats.handlers_served.fetch_add(1, Ordering::Relaxed);
            return Ok(handler);
        }
    }

    /// Serve one request on a fresh handler, then kill it
    pub async fn serve<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let mut handler = match self.acquire().await {
            Ok(handler) => handler,
            Err(e) => return error_response(FailureKind::RequestError, &e.to_string()),
        };

        let response = handler.serve(req).await;
        // Reaping happens off the request path
        tokio::spawn(handler.close());
        response
    }

    /// Stop replenishing and kill every queued handler.
    ///
    /// Handlers already handed out stay the caller's to close.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let replenisher = self.replenisher.lock().take();
        if let Some(task) = replenisher {
            if let Err(e) = task.await {
                error!(error = %e, "Handler replenisher task failed");
            }
        }

        let mut ready = self.ready.lock().await;
        ready.close();
        let mut closed = 0;
        while let Some(handler) = ready.recv().await {
            self.stats.ready.fetch_sub(1, Ordering::Relaxed);
            handler.close().await;
            closed += 1;
        }
        info!(closed, "Handler pool shut down");
    }
}

/// Keep the queue full until shutdown. Launch failures are retried after `backoff`.
async fn replenish(
    launcher: Launcher,
    settings: HandlerSettings,
    tx: mpsc::Sender<Handler>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<PoolStats>,
    backoff: Duration,
) {
    loop {
        let started = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
            started = Handler::start(&launcher, &settings) => started,
        };

        match started {
            Ok(handler) => {
                stats.handlers_started.fetch_add(1, Ordering::Relaxed);
                debug!(port = handler.port(), "Handler ready, waiting for queue space");

                let permit = tokio::select! {
                    biased;
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => None,
                    permit = tx.reserve() => permit.ok(),
                };

                match permit {
                    Some(permit) => {
                        stats.ready.fetch_add(1, Ordering::Relaxed);
                        permit.send(handler);
                    }
                    None => {
                        handler.close().await;
                        break;
                    }
                }
            }
            Err(e) => {
                stats.launch_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Failed to start handler");
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stopped| *stopped) => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    debug!("Handler replenisher stopped");
}
