//! Mock indexing, matching, and consumption for replay sessions.

mod flatten;
mod matcher;
mod store;

pub use flatten::{flatten_body, flatten_json};
pub use matcher::find_best_match;
pub use store::MockStore;
