use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of price points retained per side of a market.
const DEFAULT_CAPACITY: usize = 512;

/// Timestamped price history for one side of a market.
///
/// Insertion is monotonic in practice (timestamps come from the wall
/// clock) but reads are defined as "the value at the greatest key", so an
/// out-of-order insert cannot corrupt the latest price. Once the capacity
/// is reached the oldest point is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistory {
    points: BTreeMap<u64, Decimal>,
    capacity: usize,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a price at the given unix timestamp. Two prices cannot share
    /// one timestamp.
    pub fn insert(&mut self, timestamp: u64, price: Decimal) -> Result<()> {
        if self.points.contains_key(&timestamp) {
            return Err(Error::PriceExists);
        }
        self.points.insert(timestamp, price);
        while self.points.len() > self.capacity {
            let oldest = *self.points.keys().next().expect("non-empty history");
            self.points.remove(&oldest);
        }
        Ok(())
    }

    /// The most recent price, if any.
    pub fn latest(&self) -> Option<Decimal> {
        self.points.values().next_back().copied()
    }

    /// Latest price or zero; mirrors how an unset side is treated by the
    /// pluggable strategy checks.
    pub fn latest_or_zero(&self) -> Decimal {
        self.latest().unwrap_or(Decimal::ZERO)
    }

    /// True when no price has ever been set, or the latest one is zero.
    pub fn is_zero(&self) -> bool {
        match self.latest() {
            None => true,
            Some(p) => p.is_zero(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_wins() {
        let mut h = PriceHistory::new();
        h.insert(10, Decimal::from(100)).unwrap();
        h.insert(20, Decimal::from(200)).unwrap();
        h.insert(15, Decimal::from(150)).unwrap();
        assert_eq!(h.latest(), Some(Decimal::from(200)));
    }

    #[test]
    fn duplicate_timestamp_rejected() {
        let mut h = PriceHistory::new();
        h.insert(10, Decimal::from(100)).unwrap();
        assert!(matches!(
            h.insert(10, Decimal::from(101)),
            Err(Error::PriceExists)
        ));
    }

    #[test]
    fn empty_history_is_zero() {
        let h = PriceHistory::new();
        assert!(h.is_zero());
        assert_eq!(h.latest_or_zero(), Decimal::ZERO);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut h = PriceHistory::new();
        h.capacity = 3;
        for ts in 1..=5u64 {
            h.insert(ts, Decimal::from(ts)).unwrap();
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.latest(), Some(Decimal::from(5)));
    }
}
