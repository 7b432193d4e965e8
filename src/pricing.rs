//! Default cost-per-1k-token rates, seeded into the store's `pricing`
//! table at first open, and the cost formula applied at flow finalization.
//!
//! The pricing *lookup itself* (deciding which rate applies) is an
//! external collaborator's concern once the table is populated and cached
//! — this module only supplies the seed data and the arithmetic, grounded
//! in the teacher's hardcoded Claude pricing table, generalized to the
//! other built-in providers and converted from per-million to per-1000
//! token rates to match the store schema.

use crate::model::{CostSource, Usage};
use crate::store::PricingRate;

/// A rate applied when no `(provider, model)` row matches; equivalent to
/// the teacher's "default to Sonnet pricing for unknown models" fallback.
/// Costs computed from this rate are always `estimated`.
const FALLBACK_RATE: PricingRate =
    PricingRate { input_rate: 0.003, output_rate: 0.015, cache_creation_rate: 0.00375, cache_read_rate: 0.0003 };

/// Seed rows for the store's `pricing` table, converted from published
/// per-million-token prices to the per-1000-token rates the cost formula
/// expects (`rate / 1000`).
pub fn seed_rows() -> Vec<(String, String, PricingRate)> {
    let per_million = |input: f64, output: f64, cache_creation: f64, cache_read: f64| PricingRate {
        input_rate: input / 1000.0,
        output_rate: output / 1000.0,
        cache_creation_rate: cache_creation / 1000.0,
        cache_read_rate: cache_read / 1000.0,
    };

    vec![
        ("anthropic".into(), "claude-3-5-sonnet-20241022".into(), per_million(3.00, 15.00, 3.75, 0.30)),
        ("anthropic".into(), "claude-3-5-haiku-20241022".into(), per_million(1.00, 5.00, 1.25, 0.10)),
        ("anthropic".into(), "claude-3-opus-20240229".into(), per_million(15.00, 75.00, 18.75, 1.50)),
        ("anthropic".into(), "claude-3-sonnet-20240229".into(), per_million(3.00, 15.00, 3.75, 0.30)),
        ("anthropic".into(), "claude-3-haiku-20240307".into(), per_million(0.25, 1.25, 0.30, 0.03)),
        ("openai".into(), "gpt-4o".into(), per_million(2.50, 10.00, 0.0, 1.25)),
        ("openai".into(), "gpt-4o-mini".into(), per_million(0.15, 0.60, 0.0, 0.075)),
        ("gemini".into(), "gemini-1.5-pro".into(), per_million(1.25, 5.00, 0.0, 0.3125)),
        ("gemini".into(), "gemini-1.5-flash".into(), per_million(0.075, 0.30, 0.0, 0.01875)),
    ]
}

/// Apply the §4.9 cost formula. Returns `(total_cost, cost_source)`;
/// `None` when usage carries no input tokens (nothing was actually
/// charged for, or usage extraction failed upstream).
pub fn compute_cost(usage: &Usage, rate: Option<PricingRate>) -> (Option<f64>, Option<CostSource>) {
    if usage.input_tokens == 0 {
        return (None, None);
    }

    let (rate, source) = match rate {
        Some(r) => (r, CostSource::Exact),
        None => (FALLBACK_RATE, CostSource::Estimated),
    };

    let cost = (usage.input_tokens as f64 * rate.input_rate
        + usage.output_tokens as f64 * rate.output_rate
        + usage.cache_creation_tokens as f64 * rate.cache_creation_rate
        + usage.cache_read_tokens as f64 * rate.cache_read_rate)
        / 1000.0;

    (Some(cost), Some(source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_cost_matches_known_rate() {
        let usage = Usage { input_tokens: 1000, output_tokens: 500, cache_creation_tokens: 0, cache_read_tokens: 0 };
        let rate = seed_rows().into_iter().find(|(p, m, _)| p == "anthropic" && m == "claude-3-5-sonnet-20241022").unwrap().2;
        let (cost, source) = compute_cost(&usage, Some(rate));
        assert_eq!(source, Some(CostSource::Exact));
        assert!((cost.unwrap() - 0.0105).abs() < 0.0001);
    }

    #[test]
    fn missing_rate_falls_back_to_estimated() {
        let usage = Usage { input_tokens: 1000, output_tokens: 0, cache_creation_tokens: 0, cache_read_tokens: 0 };
        let (cost, source) = compute_cost(&usage, None);
        assert_eq!(source, Some(CostSource::Estimated));
        assert!(cost.unwrap() > 0.0);
    }

    #[test]
    fn zero_input_tokens_yields_no_cost() {
        let usage = Usage::default();
        let (cost, source) = compute_cost(&usage, None);
        assert!(cost.is_none());
        assert!(source.is_none());
    }
}
