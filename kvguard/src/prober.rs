//! Health prober
//!
//! A single background task owns probing. Callers only send it a request
//! over a channel and never wait. While every backend is marked dead, a
//! request starts one probe round: every backend is pinged concurrently,
//! and the first one that answers without a connectivity error becomes
//! active again. Probe results are applied one at a time by this task, each
//! under the health write lock with a fresh liveness check, so a late
//! result never re-applies an outdated decision.

use crate::backend::Backend;
use crate::pool::PoolInner;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

enum ProbeRequest {
    Probe,
    Shutdown,
}

/// Handle to the prober task; dropping it stops the task
pub(crate) struct Prober {
    tx: mpsc::UnboundedSender<ProbeRequest>,
}

impl Prober {
    /// Spawn the prober for a pool that is still being built
    pub(crate) fn spawn<B: Backend>(pool: Weak<PoolInner<B>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::worker(pool, rx));
        Self { tx }
    }

    /// Fire-and-forget probe request
    pub(crate) fn trigger(&self) {
        let _ = self.tx.send(ProbeRequest::Probe);
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(ProbeRequest::Shutdown);
    }

    async fn worker<B: Backend>(
        pool: Weak<PoolInner<B>>,
        mut rx: mpsc::UnboundedReceiver<ProbeRequest>,
    ) {
        let mut probes: FuturesUnordered<BoxFuture<'static, (usize, bool)>> =
            FuturesUnordered::new();

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(ProbeRequest::Probe) => {
                        // One round at a time
                        if !probes.is_empty() {
                            continue;
                        }
                        let Some(inner) = pool.upgrade() else { break };
                        if !inner.all_down() {
                            continue;
                        }

                        debug!(backends = inner.backends.len(), "all backends down, probing");
                        for index in 0..inner.backends.len() {
                            probes.push(Self::probe(Arc::clone(&inner), index));
                        }
                    }
                    Some(ProbeRequest::Shutdown) | None => break,
                },
                Some((index, answered)) = probes.next(), if !probes.is_empty() => {
                    if !answered {
                        continue;
                    }
                    let Some(inner) = pool.upgrade() else { break };
                    inner.apply_probe(index);
                }
            }
        }

        debug!("prober stopped");
    }

    fn probe<B: Backend>(inner: Arc<PoolInner<B>>, index: usize) -> BoxFuture<'static, (usize, bool)> {
        async move {
            let answered = match inner.backends[index].ping().await {
                Ok(()) => true,
                // An error reply still proves the server is reachable
                Err(err) => !err.is_connectivity(),
            };
            (index, answered)
        }
        .boxed()
    }
}
