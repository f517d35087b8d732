//! Blocking Watcher
//!
//! Drives the long-poll loop for one [`WatchTarget`]:
//! 1. Issue a blocking read with `wait_index = cursor`.
//! 2. On success, move the cursor to the returned index and report the value,
//!    absent or not, to the handler.
//! 3. On failure, report the error, back off, and retry with the same cursor.
//!
//! Consecutive polls are spaced by at least `min_poll_interval`, so an index that
//! moves on every call cannot turn the loop into a request storm.

use super::types::*;
use crate::backend::{CoordinationError, QueryOptions, SharedBackend};
use crate::config::CoordinatorConfig;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receives the results of a watcher's polls, on the watcher's own task.
///
/// Implementations must return quickly: a slow handler delays the next poll.
pub trait WatchHandler: Send {
    fn on_change(&mut self, event: &WatchEvent);

    fn on_error(&mut self, target: &WatchTarget, error: &CoordinationError) {
        tracing::warn!("Watch of {} failed: {}", target, error);
    }
}

/// Adapts a pair of closures into a [`WatchHandler`].
pub struct FnWatchHandler<C, E> {
    on_change: C,
    on_error: E,
}

impl<C, E> FnWatchHandler<C, E>
where
    C: FnMut(&WatchEvent) + Send,
    E: FnMut(&CoordinationError) + Send,
{
    pub fn new(on_change: C, on_error: E) -> Self {
        Self {
            on_change,
            on_error,
        }
    }
}

impl<C, E> WatchHandler for FnWatchHandler<C, E>
where
    C: FnMut(&WatchEvent) + Send,
    E: FnMut(&CoordinationError) + Send,
{
    fn on_change(&mut self, event: &WatchEvent) {
        (self.on_change)(event)
    }

    fn on_error(&mut self, _target: &WatchTarget, error: &CoordinationError) {
        (self.on_error)(error)
    }
}

/// Logs every observation, the way the command line watchers report them.
pub struct LoggingHandler;

impl WatchHandler for LoggingHandler {
    fn on_change(&mut self, event: &WatchEvent) {
        tracing::info!("{}", event);
    }
}

/// Forwards events to an unbounded channel so the consumer never stalls polling.
pub struct ChannelWatchHandler {
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl ChannelWatchHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl WatchHandler for ChannelWatchHandler {
    fn on_change(&mut self, event: &WatchEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!("Watch receiver for {} dropped", event.target);
        }
    }
}

pub struct BlockingWatcher {
    backend: SharedBackend,
    target: WatchTarget,
    options: WatchOptions,
    cursor: IndexCursor,
}

impl BlockingWatcher {
    pub fn new(backend: SharedBackend, target: WatchTarget, options: WatchOptions) -> Self {
        Self {
            backend,
            target,
            options,
            cursor: IndexCursor::new(),
        }
    }

    pub fn from_config(
        backend: SharedBackend,
        target: WatchTarget,
        config: &CoordinatorConfig,
    ) -> Self {
        Self::new(backend, target, WatchOptions::from_config(config))
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn last_index(&self) -> u64 {
        self.cursor.wait_index()
    }

    /// A single read of the target, blocking server-side when `wait_index > 0`.
    pub async fn poll_once(&self, wait_index: u64) -> Result<WatchEvent, CoordinationError> {
        let opts = QueryOptions::blocking(wait_index, self.options.wait_time);

        let (value, meta) = match &self.target {
            WatchTarget::Key(key) => {
                let (pair, meta) = self.backend.kv_get(key, opts).await?;
                (ObservedValue::Key(pair), meta)
            }
            WatchTarget::Service(name) => {
                let (entries, meta) = self.backend.catalog_service(name, opts).await?;
                let mut instances: Vec<ServiceInstance> = entries
                    .into_iter()
                    .map(|entry| ServiceInstance {
                        address: entry.address,
                        port: entry.port,
                        service_id: entry.service_id,
                    })
                    .collect();
                instances.sort();
                (ObservedValue::Service(instances), meta)
            }
        };

        Ok(WatchEvent {
            target: self.target.clone(),
            value,
            index: meta.last_index,
        })
    }

    /// Runs the watch loop until `cancel` fires. Returns the last index seen.
    pub async fn run<H: WatchHandler>(mut self, mut handler: H, cancel: CancellationToken) -> u64 {
        tracing::info!("Watching {}", self.target);

        loop {
            let started = Instant::now();
            let wait_index = self.cursor.wait_index();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.poll_once(wait_index) => result,
            };

            match result {
                Ok(event) => {
                    if let CursorMove::Regressed { from } = self.cursor.advance(event.index) {
                        tracing::debug!(
                            "Index of {} went backwards ({} -> {}), taking it as new baseline",
                            self.target,
                            from,
                            event.index
                        );
                    }

                    handler.on_change(&event);

                    let elapsed = started.elapsed();
                    if elapsed < self.options.min_poll_interval
                        && !pause(&cancel, self.options.min_poll_interval - elapsed).await
                    {
                        break;
                    }
                }
                Err(e) => {
                    handler.on_error(&self.target, &e);

                    if !pause(&cancel, self.options.error_backoff).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Stopped watching {} at index {}", self.target, self.cursor.wait_index());
        self.cursor.wait_index()
    }

    /// Runs the loop on its own task.
    pub fn spawn<H>(self, handler: H, cancel: CancellationToken) -> JoinHandle<u64>
    where
        H: WatchHandler + 'static,
    {
        tokio::spawn(self.run(handler, cancel))
    }
}

/// Sleeps for `duration`; returns `false` if cancelled first.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
