use crate::backend::{KvPair, SessionBehavior, SessionId};

use std::time::Duration;

/// A server-side session owned by exactly one holder.
///
/// Not `Clone`: destroying the lease consumes it, so it can only happen once.
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: SessionId,
    pub ttl: Duration,
    /// What happens to locked keys when the lease ends.
    pub behavior: SessionBehavior,
}

/// Who holds the lock on a key, as seen by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unheld,
    HeldByThisSession,
    HeldByOther(SessionId),
}

impl LockState {
    /// Classifies a key (or its absence) from the point of view of `session`.
    pub fn observe(pair: Option<&KvPair>, session: &SessionId) -> Self {
        match pair.and_then(|pair| pair.session.as_ref()) {
            None => LockState::Unheld,
            Some(holder) if holder == session => LockState::HeldByThisSession,
            Some(holder) => LockState::HeldByOther(holder.clone()),
        }
    }

    pub fn is_held(&self) -> bool {
        !matches!(self, LockState::Unheld)
    }
}
