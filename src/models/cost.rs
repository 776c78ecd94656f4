use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use super::messages::Usage;
use super::pricing::ModelPricing;

/// Costs are stored as NUMERIC(15,6).
const COST_SCALE: u32 = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CostBreakdown {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_write_cost: Decimal,
    pub cache_read_cost: Decimal,
    pub total_cost: Decimal,
}

fn token_cost(tokens: u64, price_per_million: Decimal) -> Decimal {
    (Decimal::from(tokens) * price_per_million / Decimal::from(1_000_000u32))
        .round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Cost of one request. Each category is rounded half-up to six decimals
/// before summing; unknown pricing costs nothing.
pub fn calculate_cost(usage: &Usage, pricing: Option<&ModelPricing>) -> CostBreakdown {
    let Some(p) = pricing else {
        return CostBreakdown::default();
    };

    let input_cost = token_cost(usage.input_tokens, p.input_price_per_million);
    let output_cost = token_cost(usage.output_tokens, p.output_price_per_million);
    let cache_write_cost = token_cost(usage.cache_creation(), p.cache_write_price_per_million);
    let cache_read_cost = token_cost(usage.cache_read(), p.cache_read_price_per_million);

    CostBreakdown {
        input_cost,
        output_cost,
        cache_write_cost,
        cache_read_cost,
        total_cost: input_cost + output_cost + cache_write_cost + cache_read_cost,
    }
}

// ── Tests ───────────────────────────────────────────────────────
