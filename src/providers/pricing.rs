use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::providers::backend::TokenUsage;

/// Token-based cost in integer cents, from prices in dollars per 1k tokens.
/// Midpoints round away from zero so 12.5 cents bills as 13.
pub fn cost_cents(usage: &TokenUsage, price_in_per_1k: Decimal, price_out_per_1k: Decimal) -> i64 {
    let thousand = Decimal::from(1000);
    let dollars = Decimal::from(usage.input_tokens) / thousand * price_in_per_1k
        + Decimal::from(usage.output_tokens) / thousand * price_out_per_1k;
    (dollars * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Rough token estimate for streamed content where the provider reports no
/// usage: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Static per-model default prices (dollars per 1k input/output tokens),
/// used when the registry supplies no price for a model.
pub struct PriceTable {
    prices: HashMap<String, (Decimal, Decimal)>,
}

impl PriceTable {
    pub fn from_pairs(pairs: &[(&str, &str, &str)]) -> Self {
        let prices = pairs
            .iter()
            .map(|(model, input, output)| {
                (
                    model.to_string(),
                    (
                        input.parse().expect("static input price"),
                        output.parse().expect("static output price"),
                    ),
                )
            })
            .collect();
        Self { prices }
    }

    pub fn get(&self, model: &str) -> Option<(Decimal, Decimal)> {
        self.prices.get(model).copied()
    }

    /// Effective prices for a request: registry-supplied when non-zero,
    /// otherwise the static table, otherwise free.
    pub fn resolve(
        &self,
        model: &str,
        price_in: Decimal,
        price_out: Decimal,
    ) -> (Decimal, Decimal) {
        if price_in > Decimal::ZERO || price_out > Decimal::ZERO {
            (price_in, price_out)
        } else {
            self.get(model).unwrap_or((Decimal::ZERO, Decimal::ZERO))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_cost_rounds_midpoint_up() {
        // 1000 input / 500 output tokens at $0.05/$0.15 per 1k:
        // 0.05 + 0.075 = $0.125 = 12.5 cents -> 13.
        let usage = TokenUsage::new(1000, 500);
        assert_eq!(cost_cents(&usage, dec("0.05"), dec("0.15")), 13);
    }

    #[test]
    fn test_cost_zero_usage() {
        let usage = TokenUsage::new(0, 0);
        assert_eq!(cost_cents(&usage, dec("0.05"), dec("0.15")), 0);
    }

    #[test]
    fn test_cost_exact_cents() {
        // 2000 input at $0.05/1k = $0.10 = 10 cents.
        let usage = TokenUsage::new(2000, 0);
        assert_eq!(cost_cents(&usage, dec("0.05"), dec("0.15")), 10);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("hello world, how are you"), 6);
    }

    #[test]
    fn test_price_table_resolution() {
        let table = PriceTable::from_pairs(&[("llama-3.1-8b", "0.00005", "0.00008")]);

        // Registry price wins when set.
        let (input, output) = table.resolve("llama-3.1-8b", dec("0.01"), dec("0.02"));
        assert_eq!(input, dec("0.01"));
        assert_eq!(output, dec("0.02"));

        // Zero registry price falls back to the table.
        let (input, _) = table.resolve("llama-3.1-8b", Decimal::ZERO, Decimal::ZERO);
        assert_eq!(input, dec("0.00005"));

        // Unknown model with no registry price is free.
        let (input, output) = table.resolve("mystery", Decimal::ZERO, Decimal::ZERO);
        assert_eq!(input, Decimal::ZERO);
        assert_eq!(output, Decimal::ZERO);
    }
}
