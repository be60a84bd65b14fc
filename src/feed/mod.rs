//! Feed sources other than the live connection.

pub mod simulated;

pub use simulated::{FeedHandle, SimulatedFeed, SimulatedFeedConfig};
