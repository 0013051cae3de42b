//! Authoritative rate table
//!
//! Rates are stored relative to a fixed base currency (whose entry is
//! always exactly 1.0). Any other pair is derived as a ratio. A single
//! `RwLock` guards the whole map so a fluctuation batch is observed either
//! entirely or not at all.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use currency_core::{CurrencyCode, RateError, RateResult};

/// Initial snapshot handed to the table at startup
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    pub base: CurrencyCode,
    pub rates: HashMap<CurrencyCode, f64>,
}

impl RateSnapshot {
    pub fn new(base: CurrencyCode, rates: HashMap<CurrencyCode, f64>) -> Self {
        Self { base, rates }
    }
}

#[derive(Debug)]
pub struct RateTable {
    base: CurrencyCode,
    rates: RwLock<HashMap<CurrencyCode, f64>>,

    /// Stats
    update_count: AtomicU64,
    last_update: RwLock<Instant>,
}

impl RateTable {
    /// Build the table from an initial snapshot. The base entry is always
    /// forced to 1.0; every other rate must be finite and positive.
    pub fn from_snapshot(snapshot: RateSnapshot) -> RateResult<Self> {
        let RateSnapshot { base, mut rates } = snapshot;

        for (code, rate) in &rates {
            if *code != base && !is_valid_rate(*rate) {
                return Err(RateError::InvalidRate { code: *code, rate: *rate });
            }
        }
        rates.insert(base, 1.0);

        Ok(Self {
            base,
            rates: RwLock::new(rates),
            update_count: AtomicU64::new(0),
            last_update: RwLock::new(Instant::now()),
        })
    }

    pub fn base(&self) -> CurrencyCode {
        self.base
    }

    /// Rate of `destination` per one unit of `base`
    pub fn get_rate(&self, base: CurrencyCode, destination: CurrencyCode) -> RateResult<f64> {
        let rates = self.rates.read();

        let base_rate = rates.get(&base).ok_or(RateError::UnknownCurrency(base))?;
        let dest_rate = rates
            .get(&destination)
            .ok_or(RateError::UnknownCurrency(destination))?;

        Ok(dest_rate / base_rate)
    }

    pub fn contains(&self, code: CurrencyCode) -> bool {
        self.rates.read().contains_key(&code)
    }

    /// Consistent copy of every entry
    pub fn snapshot(&self) -> HashMap<CurrencyCode, f64> {
        self.rates.read().clone()
    }

    /// Known currencies, sorted
    pub fn currencies(&self) -> Vec<CurrencyCode> {
        let mut codes: Vec<_> = self.rates.read().keys().copied().collect();
        codes.sort();
        codes
    }

    pub fn len(&self) -> usize {
        self.rates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.read().is_empty()
    }

    /// Multiply a single entry by `factor`
    pub fn apply_factor(&self, code: CurrencyCode, factor: f64) -> RateResult<f64> {
        let mut rates = self.rates.write();
        let updated = self.scale_entry(&mut rates, code, factor)?;
        drop(rates);

        self.record_update();
        Ok(updated)
    }

    /// Apply a whole batch of factors under one write lock. Nothing is
    /// written if any entry in the batch is rejected. A code listed more
    /// than once gets the product of its factors, validated as a whole.
    pub fn apply_batch(&self, factors: &[(CurrencyCode, f64)]) -> RateResult<usize> {
        let mut rates = self.rates.write();

        let mut staged: HashMap<CurrencyCode, f64> = HashMap::with_capacity(factors.len());
        for (code, factor) in factors {
            self.check_target(&rates, *code)?;
            let current = staged.get(code).copied().unwrap_or(rates[code]);
            let updated = current * factor;
            if !is_valid_rate(updated) {
                return Err(RateError::InvalidRate { code: *code, rate: updated });
            }
            staged.insert(*code, updated);
        }

        let changed = staged.len();
        rates.extend(staged);
        drop(rates);

        self.record_update();
        Ok(changed)
    }

    fn check_target(&self, rates: &HashMap<CurrencyCode, f64>, code: CurrencyCode) -> RateResult<()> {
        if code == self.base {
            return Err(RateError::BaseCurrencyImmutable(code));
        }
        if !rates.contains_key(&code) {
            return Err(RateError::UnknownCurrency(code));
        }
        Ok(())
    }

    fn scale_entry(
        &self,
        rates: &mut HashMap<CurrencyCode, f64>,
        code: CurrencyCode,
        factor: f64,
    ) -> RateResult<f64> {
        self.check_target(rates, code)?;

        let entry = rates.get_mut(&code).ok_or(RateError::UnknownCurrency(code))?;
        let updated = *entry * factor;
        if !is_valid_rate(updated) {
            return Err(RateError::InvalidRate { code, rate: updated });
        }
        *entry = updated;
        Ok(updated)
    }

    fn record_update(&self) {
        self.update_count.fetch_add(1, Ordering::Relaxed);
        *self.last_update.write() = Instant::now();
    }

    /// Stats
    pub fn stats(&self) -> RateTableStats {
        RateTableStats {
            currency_count: self.len(),
            update_count: self.update_count.load(Ordering::Relaxed),
            last_update_age: self.last_update.read().elapsed(),
        }
    }
}

fn is_valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

/// Statistics about the rate table
#[derive(Debug, Clone)]
pub struct RateTableStats {
    pub currency_count: usize,
    pub update_count: u64,
    pub last_update_age: Duration,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    fn code(s: &str) -> CurrencyCode {
        CurrencyCode::new(s).unwrap()
    }

    pub(crate) fn sample_table() -> RateTable {
        let rates = HashMap::from([
            (CurrencyCode::USD, 1.10),
            (CurrencyCode::GBP, 0.90),
        ]);
        RateTable::from_snapshot(RateSnapshot::new(CurrencyCode::EUR, rates)).unwrap()
    }

    #[test]
    fn test_cross_rate_is_ratio() {
        let table = sample_table();

        let rate = table.get_rate(CurrencyCode::GBP, CurrencyCode::USD).unwrap();
        assert!((rate - 1.10 / 0.90).abs() < 1e-12);
        assert!((rate - 1.2222).abs() < 1e-4);

        let rate = table.get_rate(CurrencyCode::EUR, CurrencyCode::USD).unwrap();
        assert!((rate - 1.10).abs() < 1e-12);
    }

    #[test]
    fn test_base_entry_is_one() {
        let rates = HashMap::from([(CurrencyCode::EUR, 3.0), (CurrencyCode::USD, 1.1)]);
        let table = RateTable::from_snapshot(RateSnapshot::new(CurrencyCode::EUR, rates)).unwrap();

        assert_eq!(table.snapshot()[&CurrencyCode::EUR], 1.0);
        assert_eq!(table.get_rate(CurrencyCode::EUR, CurrencyCode::EUR).unwrap(), 1.0);
    }

    #[test]
    fn test_unknown_currency() {
        let table = sample_table();

        assert_eq!(
            table.get_rate(code("XYZ"), CurrencyCode::USD),
            Err(RateError::UnknownCurrency(code("XYZ")))
        );
        assert_eq!(
            table.get_rate(CurrencyCode::USD, CurrencyCode::JPY),
            Err(RateError::UnknownCurrency(CurrencyCode::JPY))
        );
    }

    #[test]
    fn test_snapshot_rejects_non_positive_rate() {
        let rates = HashMap::from([(CurrencyCode::USD, -1.0)]);
        let result = RateTable::from_snapshot(RateSnapshot::new(CurrencyCode::EUR, rates));
        assert!(matches!(result, Err(RateError::InvalidRate { .. })));
    }

    #[test]
    fn test_apply_factor() {
        let table = sample_table();

        let updated = table.apply_factor(CurrencyCode::USD, 1.05).unwrap();
        assert!((updated - 1.155).abs() < 1e-12);
        assert_eq!(table.stats().update_count, 1);

        assert_eq!(
            table.apply_factor(CurrencyCode::EUR, 1.05),
            Err(RateError::BaseCurrencyImmutable(CurrencyCode::EUR))
        );
        assert_eq!(
            table.apply_factor(CurrencyCode::JPY, 1.05),
            Err(RateError::UnknownCurrency(CurrencyCode::JPY))
        );
    }

    #[test]
    fn test_apply_batch_is_all_or_nothing() {
        let table = sample_table();
        let before = table.snapshot();

        let result = table.apply_batch(&[(CurrencyCode::USD, 1.1), (CurrencyCode::EUR, 0.9)]);
        assert_eq!(result, Err(RateError::BaseCurrencyImmutable(CurrencyCode::EUR)));
        assert_eq!(table.snapshot(), before);

        let applied = table
            .apply_batch(&[(CurrencyCode::USD, 1.1), (CurrencyCode::GBP, 0.9)])
            .unwrap();
        assert_eq!(applied, 2);
        assert!((table.snapshot()[&CurrencyCode::GBP] - 0.81).abs() < 1e-12);
    }

    #[test]
    fn test_apply_batch_repeated_code_is_combined() {
        let table = sample_table();

        let applied = table
            .apply_batch(&[(CurrencyCode::USD, 2.0), (CurrencyCode::USD, 0.5)])
            .unwrap();
        assert_eq!(applied, 1);
        assert!((table.snapshot()[&CurrencyCode::USD] - 1.10).abs() < 1e-12);

        // Each factor alone is fine, the combined product underflows to zero
        let before = table.snapshot();
        let result = table.apply_batch(&[
            (CurrencyCode::GBP, 1e-200),
            (CurrencyCode::GBP, 1e-200),
        ]);
        assert!(matches!(result, Err(RateError::InvalidRate { code, .. }) if code == CurrencyCode::GBP));
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn test_concurrent_reads_during_batches() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(sample_table());

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for _ in 0..200 {
                    table
                        .apply_batch(&[(CurrencyCode::USD, 1.01), (CurrencyCode::GBP, 1.01)])
                        .unwrap();
                }
            })
        };

        // USD/GBP only moves when the two legs move separately
        let initial = table.get_rate(CurrencyCode::GBP, CurrencyCode::USD).unwrap();
        for _ in 0..200 {
            let rate = table.get_rate(CurrencyCode::GBP, CurrencyCode::USD).unwrap();
            assert!((rate - initial).abs() < 1e-9);
        }

        writer.join().unwrap();
        assert_eq!(table.stats().update_count, 200);
    }

    proptest! {
        #[test]
        fn prop_get_rate_is_ratio(usd in 0.01f64..1000.0, gbp in 0.01f64..1000.0) {
            let rates = HashMap::from([(CurrencyCode::USD, usd), (CurrencyCode::GBP, gbp)]);
            let table = RateTable::from_snapshot(RateSnapshot::new(CurrencyCode::EUR, rates)).unwrap();

            let rate = table.get_rate(CurrencyCode::GBP, CurrencyCode::USD).unwrap();
            prop_assert!((rate - usd / gbp).abs() <= 1e-12 * (usd / gbp).max(1.0));

            let inverse = table.get_rate(CurrencyCode::USD, CurrencyCode::GBP).unwrap();
            prop_assert!((rate * inverse - 1.0).abs() < 1e-9);
        }
    }
}
