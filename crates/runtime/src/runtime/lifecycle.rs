use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, PoisonError};
use std::thread;

use tracing::{debug, error, info, warn};

use confluence_core::{CommError, Rank, TopologySnapshot};

use crate::dispatch::Dispatcher;

use super::{Runtime, RUNNING, STOPPED};

impl Runtime {
    /// Initialize the substrate and start the dispatch thread.
    ///
    /// The substrate is initialized on the dispatch thread itself; this call
    /// blocks until that finishes or `dispatch.init_timeout_ms` elapses.
    /// Calling `start` on a running runtime is a no-op, and a runtime that
    /// was shut down can be started again.
    pub fn start(&self) -> Result<(), CommError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| CommError::lock_poisoned("dispatch worker"))?;
        if self.is_running() {
            return Ok(());
        }
        if let Some(stale) = worker.take() {
            // Left behind by an initialization that timed out.
            debug!("Joining dispatch thread from an earlier failed start");
            if stale.join().is_err() {
                error!("Dispatch thread from an earlier failed start panicked");
            }
        }

        self.config.log_summary();
        self.shutdown.store(false, Ordering::Release);
        let initial = TopologySnapshot::isolated(self.rank());
        *self.topology.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(initial.clone());

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.substrate),
            Arc::clone(&self.handlers),
            Arc::clone(&self.topology),
            self.config.dispatch.idle_sleep(),
        )
        .with_metrics(Arc::clone(&self.metrics))
        .with_shutdown_signal(Arc::clone(&self.shutdown));

        let substrate = Arc::clone(&self.substrate);
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name(self.config.dispatch.thread_name.clone())
            .spawn(move || match substrate.initialize() {
                Ok(()) => {
                    // The caller may have given up waiting; run regardless
                    // so the substrate is still finalized on shutdown.
                    let _ = tx.send(Ok(()));
                    dispatcher.run();
                }
                Err(e) => {
                    error!(error = %e, "Substrate initialization failed");
                    let _ = tx.send(Err(e));
                }
            })
            .map_err(|e| CommError::Unknown(format!("failed to spawn dispatch thread: {e}")))?;

        let timeout = self.config.dispatch.init_timeout();
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => {
                // Start every run from the same topology the dispatcher sees.
                let status = self.substrate.set_topology(&initial);
                if !status.is_ok() {
                    warn!(status = %status, "Substrate rejected the initial topology");
                }
                self.queue.reopen();
                self.state.store(RUNNING, Ordering::Release);
                *worker = Some(handle);
                info!(rank = self.rank(), size = self.size(), "Runtime started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(?timeout, "Substrate initialization timed out");
                self.shutdown.store(true, Ordering::Release);
                *worker = Some(handle);
                Err(CommError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(CommError::Unknown(
                    "dispatch thread exited during initialization".to_string(),
                ))
            }
        }
    }

    /// Stop admitting requests, let the dispatch thread fail whatever is
    /// still queued, and join it.
    ///
    /// Failing to join the dispatch thread is the one fatal condition.
    pub fn shutdown(&self) -> Result<(), CommError> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| CommError::lock_poisoned("dispatch worker"))?;
        let Some(handle) = worker.take() else {
            return Ok(());
        };

        info!("Runtime shutdown requested");
        if self.is_running() {
            self.state.store(STOPPED, Ordering::Release);
        }
        self.queue.close();
        self.shutdown.store(true, Ordering::Release);

        handle.join().map_err(|_| {
            error!("Dispatch thread panicked and could not be joined");
            CommError::Unknown("failed to join the dispatch thread".to_string())
        })?;
        info!("Runtime stopped");
        Ok(())
    }

    /// Replace the virtual topology.
    ///
    /// Refused while any request is queued or executing, or while windows
    /// are open. The check and the replacement happen under the queue lock,
    /// so nothing can be admitted in between.
    pub fn set_topology(&self, topology: TopologySnapshot) -> Result<(), CommError> {
        self.replace_topology(|_| topology)
    }

    /// Keep the current graph and replace only its weights.
    pub fn set_topology_weights(
        &self,
        weights: Option<BTreeMap<Rank, f64>>,
    ) -> Result<(), CommError> {
        self.replace_topology(|current| {
            let next =
                TopologySnapshot::new(current.in_neighbors.clone(), current.out_neighbors.clone());
            match weights {
                Some(weights) => next.with_weights(weights),
                None => {
                    debug!("Clearing topology weights");
                    next
                }
            }
        })
    }

    /// Build the next topology from the installed one and install it, all
    /// under the queue lock.
    fn replace_topology(
        &self,
        build: impl FnOnce(&TopologySnapshot) -> TopologySnapshot,
    ) -> Result<(), CommError> {
        self.ensure_running()?;

        self.queue.with_idle(|| -> Result<(), CommError> {
            if !self.substrate.windows_empty() {
                return Err(CommError::Precondition(
                    "cannot change the topology while windows are open; free them first"
                        .to_string(),
                ));
            }
            let topology = build(&self.load_topology());
            topology.validate(self.size(), self.rank())?;
            self.substrate.set_topology(&topology).into_result()?;
            info!(
                indegree = topology.indegree(),
                outdegree = topology.outdegree(),
                weighted = topology.is_weighted(),
                "Topology updated"
            );
            *self
                .topology
                .write()
                .map_err(|_| CommError::lock_poisoned("topology"))? = Arc::new(topology);
            Ok(())
        })??;
        Ok(())
    }
}
