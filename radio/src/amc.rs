//! Adaptive modulation and coding: map channel quality to transport efficiency.
//!
//! The [ChannelModel] is a read-only lookup from a channel-quality indicator (1-based)
//! to the number of bits one resource unit carries in one scheduling round. Indicators
//! outside the table are clamped to the nearest entry, so a lookup never fails.

use crate::Error;

/// Bits per resource unit for channel-quality indicators 1 through 15.
pub const DEFAULT_TABLE: [u32; 15] = [
    22, 34, 54, 87, 126, 169, 213, 276, 347, 393, 478, 562, 651, 737, 800,
];

/// Channel-quality to efficiency lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelModel {
    table: Vec<u32>,
}

impl Default for ChannelModel {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_vec(),
        }
    }
}

impl ChannelModel {
    /// Build a model from bits-per-unit entries for indicators `1..=table.len()`.
    ///
    /// Entries must be positive and non-decreasing.
    pub fn new(table: Vec<u32>) -> Result<Self, Error> {
        if table.is_empty() {
            return Err(Error::InvalidChannelTable("empty"));
        }
        if table.len() > u8::MAX as usize {
            return Err(Error::InvalidChannelTable("too many entries"));
        }
        if table.contains(&0) {
            return Err(Error::InvalidChannelTable("zero efficiency"));
        }
        if table.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(Error::InvalidChannelTable("decreasing efficiency"));
        }
        Ok(Self { table })
    }

    /// Highest defined indicator.
    pub fn max_indicator(&self) -> u8 {
        self.table.len() as u8
    }

    /// Clamp `indicator` into the defined range.
    pub fn clamp(&self, indicator: i32) -> u8 {
        indicator.clamp(1, self.max_indicator() as i32) as u8
    }

    /// Bits carried by one resource unit at `indicator`.
    pub fn efficiency(&self, indicator: u8) -> u32 {
        self.table[self.clamp(indicator as i32) as usize - 1]
    }

    /// The least efficient entry, used to size guaranteed-rate reservations.
    pub fn worst_case(&self) -> u32 {
        self.table[0]
    }
}

/// Resource units needed to carry `bits` at `efficiency` bits per unit (rounded up).
pub fn units(bits: u64, efficiency: u32) -> u64 {
    bits.div_ceil(efficiency.max(1) as u64)
}

/// Bits a flow of `rate` bits per second needs in every round of `interval` milliseconds.
pub fn round_bits(rate: u64, interval: u64) -> u64 {
    rate.saturating_mul(interval).div_ceil(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_is_monotonic() {
        let model = ChannelModel::default();
        assert_eq!(ChannelModel::new(DEFAULT_TABLE.to_vec()).unwrap(), model);
        assert_eq!(model.max_indicator(), 15);
        assert_eq!(model.worst_case(), 22);
        for indicator in 1..15 {
            assert!(model.efficiency(indicator) <= model.efficiency(indicator + 1));
        }
    }

    #[test_case(0, 22; "below range clamps to first")]
    #[test_case(1, 22; "first")]
    #[test_case(8, 276; "middle")]
    #[test_case(15, 800; "last")]
    #[test_case(200, 800; "above range clamps to last")]
    fn test_efficiency(indicator: u8, expected: u32) {
        assert_eq!(ChannelModel::default().efficiency(indicator), expected);
    }

    #[test]
    fn test_clamp() {
        let model = ChannelModel::new(vec![10, 20, 30]).unwrap();
        assert_eq!(model.clamp(-4), 1);
        assert_eq!(model.clamp(2), 2);
        assert_eq!(model.clamp(9), 3);
    }

    #[test_case(vec![]; "empty")]
    #[test_case(vec![10, 0, 20]; "zero entry")]
    #[test_case(vec![10, 30, 20]; "decreasing")]
    fn test_invalid_table(table: Vec<u32>) {
        assert!(matches!(
            ChannelModel::new(table),
            Err(Error::InvalidChannelTable(_))
        ));
    }

    #[test]
    fn test_flat_table_allowed() {
        let model = ChannelModel::new(vec![100; 4]).unwrap();
        assert_eq!(model.efficiency(3), 100);
    }

    #[test]
    fn test_unit_math() {
        assert_eq!(units(0, 100), 0);
        assert_eq!(units(100, 100), 1);
        assert_eq!(units(101, 100), 2);
        assert_eq!(round_bits(1_000_000, 1), 1_000);
        assert_eq!(round_bits(1_500, 1), 2);
        assert_eq!(round_bits(0, 10), 0);
    }
}
