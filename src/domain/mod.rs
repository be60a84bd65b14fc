//! Domain modules organized as vertical slices.
//!
//! Each sub-module contains:
//! - `mod.rs`: feed payload types (serde structs matching the wire format)
//! - `state.rs`: state containers with update methods (for feed-driven data)

pub mod candle;
pub mod orderbook;
pub mod ticker;
pub mod trade;
