//! Token and cost accounting.

use serde::{Deserialize, Serialize};

/// Aggregated token usage and dollar cost.
///
/// The run-level record is always the componentwise sum of the per-agent
/// records, with the cost rounded to 6 decimal places.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens consumed
    pub input: u64,
    /// Output tokens produced
    pub output: u64,
    /// Tokens written to the provider cache
    pub cache_creation: u64,
    /// Tokens read from the provider cache
    pub cache_read: u64,
    /// Dollar cost, rounded to 6 decimal places
    pub cost_usd: f64,
}

impl Usage {
    /// Adds another record into this one, re-rounding the cost.
    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_creation += other.cache_creation;
        self.cache_read += other.cache_read;
        self.cost_usd = round_cost(self.cost_usd + other.cost_usd);
    }

    /// Componentwise sum over an iterator of records. The cost is summed
    /// at full precision and rounded once, so sub-microdollar components
    /// are not lost to per-step rounding.
    pub fn sum<'a>(records: impl IntoIterator<Item = &'a Usage>) -> Usage {
        let mut total = Usage::default();
        let mut cost = 0.0;
        for record in records {
            total.input += record.input;
            total.output += record.output;
            total.cache_creation += record.cache_creation;
            total.cache_read += record.cache_read;
            cost += record.cost_usd;
        }
        total.cost_usd = round_cost(cost);
        total
    }
}

/// Rounds a dollar amount to 6 decimal places.
pub fn round_cost(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sums_components() {
        let mut a = Usage {
            input: 100,
            output: 50,
            cache_creation: 10,
            cache_read: 5,
            cost_usd: 0.001,
        };
        let b = Usage {
            input: 200,
            output: 25,
            cache_creation: 0,
            cache_read: 15,
            cost_usd: 0.0025,
        };
        a.add(&b);
        assert_eq!(a.input, 300);
        assert_eq!(a.output, 75);
        assert_eq!(a.cache_creation, 10);
        assert_eq!(a.cache_read, 20);
        assert_eq!(a.cost_usd, 0.0035);
    }

    #[test]
    fn test_cost_rounds_to_six_decimals() {
        assert_eq!(round_cost(0.000_000_49), 0.0);
        assert_eq!(round_cost(0.000_000_51), 0.000_001);
        assert_eq!(round_cost(1.234_567_89), 1.234_568);
    }

    #[test]
    fn test_sum_over_many() {
        let records = vec![
            Usage {
                input: 1,
                output: 1,
                cache_creation: 0,
                cache_read: 0,
                cost_usd: 0.1,
            };
            7
        ];
        let total = Usage::sum(&records);
        assert_eq!(total.input, 7);
        assert_eq!(total.cost_usd, 0.7);
    }
}
