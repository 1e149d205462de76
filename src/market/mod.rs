pub mod book;
pub mod frames;
pub mod snapshot;
pub mod stream;

pub use book::{BookLevel, DiffOutcome, OrderBook};
pub use frames::{DepthDiff, DepthSnapshot, VenueFrame};
pub use snapshot::{ResyncDriver, SnapshotFetcher};
