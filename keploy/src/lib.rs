//! Record-and-replay API testing agent.
//!
//! The agent sits between a user application and its network dependencies.
//! During `record` it captures inbound requests as test cases and outgoing
//! calls as mocks; during `test` it re-issues the recorded requests while
//! answering the application's outgoing calls from the recorded mocks, so
//! the application can be exercised without its real databases and backends.

pub mod app;
pub mod core;
pub mod error;
pub mod hooks;
pub mod mock;
pub mod models;
pub mod parser;
pub mod platform;
pub mod proxy;
pub mod record;
pub mod replay;
pub mod runtime;
pub mod telemetry;

pub use error::{KeployError, Result};
