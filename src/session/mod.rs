//! Session Module
//!
//! Time-bounded leases on the coordination service and the locks tied to them.
//!
//! ## Core Components
//! - **`LeaseManager`**: Creates a session, keeps it alive on a background renewal
//!   task and destroys it once, strictly after the renewal task has stopped.
//! - **`LockCoordinator`**: Single atomic acquire of a key for a session. Ownership
//!   ends with the session; there is no separate unlock.
//!
//! ## Lifecycle
//! `create -> renew* -> (cancel -> join -> destroy) | (expired by the server)`

pub mod lock;
pub mod manager;
pub mod types;


pub use lock::{HeldLock, LockCoordinator};
pub use manager::{ActiveLease, LeaseManager};
pub use types::{Lease, LockState};
