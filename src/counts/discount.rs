/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Modified Kneser-Ney discounts, one set per order.

use crate::error::Error;
use anyhow::Result;
use log::warn;
use std::collections::HashMap;

/// The three discount constants of an order, estimated from its
/// counts-of-counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Discount {
    pub discount1: f64,
    pub discount2: f64,
    pub discount3plus: f64,
    /// Threshold above which a count falls in the "two or more" class.
    pub mincount2: u64,
    /// Threshold above which a count falls in the "three or more" class.
    pub mincount3: u64,
}

impl Default for Discount {
    fn default() -> Self {
        Discount {
            discount1: 0.5,
            discount2: 1.0,
            discount3plus: 1.5,
            mincount2: 2,
            mincount3: 3,
        }
    }
}

impl std::fmt::Display for Discount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "D1={:.4} D2={:.4} D3+={:.4}",
            self.discount1, self.discount2, self.discount3plus
        )
    }
}

impl Discount {
    /// Estimates the discounts from counts-of-counts. An empty map is a
    /// [`Error::Numeric`] failure; individually invalid discounts fall back
    /// to the defaults.
    pub fn estimate(count_of_counts: &HashMap<u64, u64>) -> Result<Self> {
        if count_of_counts.is_empty() {
            return Err(Error::Numeric("no events for discount estimation".into()).into());
        }
        let c = |n: u64| count_of_counts.get(&n).copied().unwrap_or(0) as f64;
        let (c1, c2, c3, c4) = (c(1), c(2), c(3), c(4));

        let mut discount = Discount::default();
        if c1 > 0.0 && c1 + 2.0 * c2 > 0.0 {
            let y = c1 / (c1 + 2.0 * c2);
            let d1 = 1.0 - 2.0 * y * c2 / c1;
            let d2 = 2.0 - 3.0 * y * c3 / c2;
            let d3 = 3.0 - 4.0 * y * c4 / c3;
            if d1.is_finite() && d1 > 0.0 {
                discount.discount1 = d1;
            } else {
                warn!("invalid D1 = {}, falling back to 0.5", d1);
            }
            if d2.is_finite() && d2 > 0.0 {
                discount.discount2 = d2;
            } else {
                warn!("invalid D2 = {}, falling back to 1.0", d2);
            }
            if d3.is_finite() && d3 > 0.0 {
                discount.discount3plus = d3;
            } else {
                warn!("invalid D3+ = {}, falling back to 1.5", d3);
            }
        } else {
            warn!("no singleton events, using default discounts");
        }
        Ok(discount)
    }

    /// The multiplicative discount of a count: `(c − D_min(c,3)) / c`.
    #[inline(always)]
    pub fn discount(&self, count: u64) -> f64 {
        debug_assert!(count > 0);
        let d = match count {
            1 => self.discount1,
            2 => self.discount2,
            _ => self.discount3plus,
        };
        (count as f64 - d) / count as f64
    }

    /// The interpolation weight handed to the lower order:
    /// `(D1·n1 + D2·n2 + D3+·n3+) / total`.
    #[inline(always)]
    pub fn lower_order_weight(&self, total: u64, observed: u64, min2: u64, min3: u64) -> f64 {
        (self.discount1 * (observed - min2) as f64
            + self.discount2 * (min2 - min3) as f64
            + self.discount3plus * min3 as f64)
            / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(u64, u64)]) -> HashMap<u64, u64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_estimate_textbook() -> Result<()> {
        // c1=20, c2=10, c3=5, c4=2: Y = 0.5.
        let d = Discount::estimate(&counts(&[(1, 20), (2, 10), (3, 5), (4, 2)]))?;
        assert!((d.discount1 - (1.0 - 2.0 * 0.5 * 10.0 / 20.0)).abs() < 1e-12);
        assert!((d.discount2 - (2.0 - 3.0 * 0.5 * 5.0 / 10.0)).abs() < 1e-12);
        assert!((d.discount3plus - (3.0 - 4.0 * 0.5 * 2.0 / 5.0)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_fallbacks() -> Result<()> {
        // No singletons at all: everything falls back.
        let d = Discount::estimate(&counts(&[(2, 10)]))?;
        assert_eq!(d, Discount::default());
        // c2 = 0 makes D2 non-finite and D1 = 1, both usable or fallback.
        let d = Discount::estimate(&counts(&[(1, 5), (3, 2)]))?;
        assert_eq!(d.discount2, 1.0);
        assert!(d.discount1 > 0.0);
        Ok(())
    }

    #[test]
    fn test_empty_is_numeric_error() {
        let err = Discount::estimate(&HashMap::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Numeric(_))
        ));
    }

    #[test]
    fn test_discount_and_weight() {
        let d = Discount::default();
        assert!((d.discount(1) - 0.5).abs() < 1e-12);
        assert!((d.discount(2) - 0.5).abs() < 1e-12);
        assert!((d.discount(10) - 0.85).abs() < 1e-12);
        // 4 events with counts 1, 1, 2, 3: total 7, observed 4, min2 2,
        // min3 1.
        let w = d.lower_order_weight(7, 4, 2, 1);
        assert!((w - (0.5 * 2.0 + 1.0 * 1.0 + 1.5 * 1.0) / 7.0).abs() < 1e-12);
    }
}
