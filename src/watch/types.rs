use crate::backend::KvPair;
use crate::config::CoordinatorConfig;

use std::fmt;
use std::time::Duration;

/// What a watcher observes. Fixed for the watcher's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Service(String),
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Key(key) => write!(f, "'{}' key", key),
            WatchTarget::Service(name) => write!(f, "'{}' service", name),
        }
    }
}

/// One reachable instance of a watched service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceInstance {
    pub address: String,
    pub port: u16,
    pub service_id: String,
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The state of a target at one index. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedValue {
    /// `None` when the key does not exist.
    Key(Option<KvPair>),
    /// Ordered by address, then port. Empty when the service is unknown.
    Service(Vec<ServiceInstance>),
}

impl ObservedValue {
    /// `true` for an absent key or a service without instances.
    pub fn is_absent(&self) -> bool {
        match self {
            ObservedValue::Key(pair) => pair.is_none(),
            ObservedValue::Service(instances) => instances.is_empty(),
        }
    }

    pub fn as_key(&self) -> Option<&KvPair> {
        match self {
            ObservedValue::Key(pair) => pair.as_ref(),
            ObservedValue::Service(_) => None,
        }
    }

    pub fn instances(&self) -> &[ServiceInstance] {
        match self {
            ObservedValue::Service(instances) => instances,
            ObservedValue::Key(_) => &[],
        }
    }
}

/// A successful poll: the observed value and the index it was observed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub target: WatchTarget,
    pub value: ObservedValue,
    pub index: u64,
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LastIndex: {}, ", self.index)?;

        match (&self.target, &self.value) {
            (WatchTarget::Key(key), ObservedValue::Key(Some(pair))) => {
                write!(f, "'{}' key value is '{}'", key, pair.value_str())
            }
            (WatchTarget::Key(key), ObservedValue::Key(None)) => {
                write!(f, "key '{}' not found", key)
            }
            (WatchTarget::Service(name), ObservedValue::Service(instances))
                if instances.is_empty() =>
            {
                write!(f, "service '{}' not found", name)
            }
            (_, ObservedValue::Service(instances)) => {
                let nodes: Vec<String> = instances.iter().map(|i| i.to_string()).collect();
                write!(f, "instances: {}", nodes.join(","))
            }
            (target, ObservedValue::Key(_)) => write!(f, "{} changed", target),
        }
    }
}

/// How the cursor moved after a successful poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    Advanced,
    Unchanged,
    /// The server reported a lower index than before (e.g. restored from a snapshot).
    Regressed { from: u64 },
}

/// Last change index seen by a watcher. Starts at 0 ("no baseline").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCursor {
    last_index: u64,
}

impl IndexCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index to supply to the next blocking read.
    pub fn wait_index(&self) -> u64 {
        self.last_index
    }

    /// Takes the index of a successful response as the new baseline, even when lower.
    pub fn advance(&mut self, index: u64) -> CursorMove {
        let previous = self.last_index;
        self.last_index = index;

        if index > previous {
            CursorMove::Advanced
        } else if index == previous {
            CursorMove::Unchanged
        } else {
            CursorMove::Regressed { from: previous }
        }
    }
}

/// Tuning of a single watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Server-side wait requested with every blocking read. `None` uses the backend default.
    pub wait_time: Option<Duration>,
    /// Pause after a failed poll.
    pub error_backoff: Duration,
    /// Minimum spacing between the start of two consecutive polls.
    pub min_poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            wait_time: None,
            error_backoff: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(200),
        }
    }
}

impl WatchOptions {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            wait_time: Some(config.wait_time),
            error_backoff: config.error_backoff,
            min_poll_interval: config.min_poll_interval,
        }
    }
}
