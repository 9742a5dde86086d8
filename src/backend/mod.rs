//! Backend module - persistent connections to the application process.
//!
//! ```text
//! BackendPool ─► BackendConnection ─► writer task ─► backend
//!                       ▲
//!   backend ─► reader task ─► route (per backend id) ─► BackendLease
//! ```

mod connection;
mod pool;

pub use connection::{BackendConnection, BackendLease, BackendSender};
pub use pool::BackendPool;

use serde::{Deserialize, Serialize};

/// How backend connections decide whether to carry concurrent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexMode {
    /// One request per backend connection at a time.
    #[default]
    Disabled,
    /// Up to `max_requests` per connection without asking.
    Enabled,
    /// Ask the backend with a get-values query on connect.
    Discover,
}
