pub mod funding;
pub mod open_interest;

use std::collections::HashMap;

use parking_lot::RwLock;

pub use funding::FundingReading;
pub use open_interest::OiReading;

/// Process-wide last-value cells for the periodic derivative monitors.
///
/// The monitors own the write side; symbol engines read their own cell when
/// building a metrics snapshot. Absence means the first poll has not landed.
#[derive(Debug, Default)]
pub struct IntelHub {
    open_interest: RwLock<HashMap<String, OiReading>>,
    funding: RwLock<HashMap<String, FundingReading>>,
}

impl IntelHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_oi(&self, symbol: &str, reading: OiReading) {
        self.open_interest.write().insert(symbol.to_string(), reading);
    }

    pub fn publish_funding(&self, symbol: &str, reading: FundingReading) {
        self.funding.write().insert(symbol.to_string(), reading);
    }

    pub fn oi(&self, symbol: &str) -> Option<OiReading> {
        self.open_interest.read().get(symbol).cloned()
    }

    pub fn funding(&self, symbol: &str) -> Option<FundingReading> {
        self.funding.read().get(symbol).cloned()
    }
}
