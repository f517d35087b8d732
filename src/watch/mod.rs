//! Watch Module
//!
//! Change notification for a single key or a service's instance list, built on
//! the coordination service's blocking queries.
//!
//! ## Core Components
//! - **`IndexCursor`**: Last change index seen; the `wait_index` of the next read.
//! - **`BlockingWatcher`**: The long-poll loop. Reports every successful read,
//!   backs off on errors and never polls faster than `min_poll_interval`.
//! - **`WatchHandler`**: Callback seam, with closure, logging and channel adapters.

pub mod types;
pub mod watcher;

#[cfg(test)]
mod tests;

pub use types::{
    CursorMove, IndexCursor, ObservedValue, ServiceInstance, WatchEvent, WatchOptions,
    WatchTarget,
};
pub use watcher::{BlockingWatcher, ChannelWatchHandler, FnWatchHandler, LoggingHandler, WatchHandler};
