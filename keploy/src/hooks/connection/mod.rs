//! Per-connection byte-stream reassembly for traffic inbound to the
//! application, and the ledger that harvests completed exchanges into test
//! cases.

mod ledger;
mod tracker;

pub use ledger::ConnectionLedger;
pub use tracker::{Exchange, MAX_BUFFER_SIZE, Tracker};
