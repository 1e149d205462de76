pub mod client;
pub mod rate_limit;

pub use client::VenueRestClient;
pub use rate_limit::{Permit, RateLimitTable};
