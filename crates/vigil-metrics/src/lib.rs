//! Dynamic collection of metric sources.
//!
//! The registry multiplexes pull gatherers (scrapers, static slices) and
//! pushed points with a TTL, fans out parallel gathers on a wall-clock
//! aligned tick, and merges the returned families.

pub mod registry;
pub mod render;

pub use registry::{
    GatherState, Gatherer, GathererKind, QueryType, Registry, SliceGatherer, TtlPusher,
};
