//! Transport module - endpoints, backend connect, front-facing listener.
//!
//! Provides abstraction over:
//! - TCP (`host:port`)
//! - Unix Domain Sockets (`unix:/path`, unix platforms)

mod endpoint;
mod listener;

pub use endpoint::{connect, BoxedReader, BoxedWriter, Endpoint, UNIX_PREFIX};
pub use listener::{Accepted, Listener};
