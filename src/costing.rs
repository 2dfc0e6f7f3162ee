use crate::catalog::{effective_price, ProviderMapping};
use crate::types::TokenUsage;

/// Per-bucket request cost in micro-USD. `estimated` is true whenever any
/// token count was imputed instead of reported by the upstream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CostBreakdown {
    pub input_cost: u64,
    pub output_cost: u64,
    pub cached_input_cost: u64,
    pub request_cost: u64,
    pub total_cost: u64,
    pub estimated: bool,
}

/// Multiply first, divide last: prices are micro-USD per million tokens,
/// so sub-micro per-token rates stay exact for realistic token counts.
fn bucket_cost(tokens: u32, price_per_million: u64) -> u64 {
    u64::from(tokens)
        .saturating_mul(price_per_million)
        .checked_div(1_000_000)
        .unwrap_or(0)
}

/// Compute the cost of a request against a provider mapping. Cached tokens
/// are billed at the cached-input rate and deducted from the prompt bucket
/// before the input rate applies.
pub fn compute(mapping: &ProviderMapping, usage: &TokenUsage, estimated: bool) -> CostBreakdown {
    let prompt = usage.prompt_tokens.unwrap_or(0);
    let completion = usage.completion_tokens.unwrap_or(0);
    let cached = usage.cached_tokens.unwrap_or(0).min(prompt);

    let price = effective_price(mapping, prompt);

    let billable_prompt = prompt.saturating_sub(cached);
    let input_cost = bucket_cost(billable_prompt, price.input);
    let cached_input_cost = match price.cached_input {
        Some(rate) => bucket_cost(cached, rate),
        // No discounted rate published: cached tokens bill as input.
        None => bucket_cost(cached, price.input),
    };
    let output_cost = bucket_cost(completion, price.output);
    let request_cost = price.per_request.unwrap_or(0);

    let total_cost = input_cost
        .saturating_add(cached_input_cost)
        .saturating_add(output_cost)
        .saturating_add(request_cost);

    CostBreakdown {
        input_cost,
        output_cost,
        cached_input_cost,
        request_cost,
        total_cost,
        estimated,
    }
}
