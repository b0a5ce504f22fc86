//! Request coalescing for field resolution.
//!
//! Concurrent `load` calls that arrive before a flush share one window. The
//! flush deduplicates keys (first-seen order), performs a single upstream
//! fetch and hands every caller its value in the order the calls were made.
//!
//! With [`FlushTrigger::EndOfTurn`] the window is flushed by the task that
//! owns the loads, through [`BatchCoalescer::drive`]. No other task or worker
//! thread can close a window early.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("{0}")]
    Upstream(String),
    #[error("batch window dropped before flush")]
    Abandoned,
}

#[async_trait]
pub trait BatchFetcher<K, V>: Send + Sync {
    /// Keys are distinct. Keys missing from the returned map resolve to `None`.
    async fn fetch(&self, keys: &[K]) -> Result<HashMap<K, V>, BatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Flush once the driving future can make no further progress, i.e. every
    /// sibling load it could issue has been enqueued.
    EndOfTurn,
    Delay(Duration),
    /// Flush only on an explicit [`BatchCoalescer::dispatch`].
    Manual,
}

type Completion<V> = oneshot::Sender<Result<Option<V>, BatchError>>;

struct Window<K, V> {
    pending: Vec<(K, Completion<V>)>,
    scheduled: bool,
}

struct Shared<K, V> {
    name: &'static str,
    fetcher: Arc<dyn BatchFetcher<K, V>>,
    trigger: FlushTrigger,
    window: Mutex<Window<K, V>>,
}

pub struct BatchCoalescer<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for BatchCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> BatchCoalescer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        fetcher: Arc<dyn BatchFetcher<K, V>>,
        trigger: FlushTrigger,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                fetcher,
                trigger,
                window: Mutex::new(Window {
                    pending: Vec::new(),
                    scheduled: false,
                }),
            }),
        }
    }

    pub async fn load(&self, key: K) -> Result<Option<V>, BatchError> {
        let (tx, rx) = oneshot::channel();

        let delay = {
            let mut window = self.lock();
            window.pending.push((key, tx));
            match self.shared.trigger {
                FlushTrigger::Delay(delay) if !window.scheduled => {
                    window.scheduled = true;
                    Some(delay)
                }
                _ => None,
            }
        };

        if let Some(delay) = delay {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.dispatch().await;
            });
        }

        rx.await.unwrap_or(Err(BatchError::Abandoned))
    }

    /// Runs `work` to completion on the current task. Under
    /// [`FlushTrigger::EndOfTurn`], whenever `work` stalls with loads pending
    /// the window is flushed here, then `work` is polled again. Other
    /// triggers leave flushing to their timer or to [`Self::dispatch`].
    pub async fn drive<F>(&self, work: F) -> F::Output
    where
        F: Future,
    {
        let mut work = std::pin::pin!(work);
        let mut flushes: FuturesUnordered<BoxFuture<'_, ()>> = FuturesUnordered::new();
        let end_of_turn = self.shared.trigger == FlushTrigger::EndOfTurn;

        std::future::poll_fn(|cx| {
            loop {
                if let Poll::Ready(output) = work.as_mut().poll(cx) {
                    return Poll::Ready(output);
                }
                if end_of_turn && self.pending_len() > 0 {
                    flushes.push(Box::pin(self.dispatch()));
                }

                let mut progressed = false;
                while let Poll::Ready(Some(())) = flushes.poll_next_unpin(cx) {
                    progressed = true;
                }
                if !progressed {
                    return Poll::Pending;
                }
            }
        })
        .await
    }

    /// Flushes the current window. A no-op when nothing is pending.
    pub async fn dispatch(&self) {
        let pending = {
            let mut window = self.lock();
            window.scheduled = false;
            std::mem::take(&mut window.pending)
        };
        if pending.is_empty() {
            return;
        }

        let mut seen = HashSet::with_capacity(pending.len());
        let keys = pending
            .iter()
            .filter(|(key, _)| seen.insert(key.clone()))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        let result = self.shared.fetcher.fetch(&keys).await;
        crate::metrics::observe_batch_flush(self.shared.name, keys.len(), result.is_ok());
        tracing::debug!(
            loader = self.shared.name,
            keys = keys.len(),
            requests = pending.len(),
            ok = result.is_ok(),
            "gateway.batch_flush"
        );

        match result {
            Ok(values) => {
                for (key, tx) in pending {
                    let _ = tx.send(Ok(values.get(&key).cloned()));
                }
            }
            Err(err) => {
                for (_, tx) in pending {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> MutexGuard<'_, Window<K, V>> {
        match self.shared.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
