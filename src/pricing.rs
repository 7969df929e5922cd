//! Cost accounting from model pricing tables.

use crate::message::TokenUsage;
use crate::models::Model;

/// USD cost of one response's usage under `model` pricing.
#[must_use]
pub fn usage_cost(model: &Model, usage: &TokenUsage) -> f64 {
    let per_token = |tokens: u64, per_million: f64| tokens as f64 * per_million / 1_000_000.0;

    per_token(usage.input_tokens, model.cost_per_1m_in)
        + per_token(usage.output_tokens, model.cost_per_1m_out)
        + per_token(usage.cache_read_tokens, model.cost_per_1m_in_cached)
        + per_token(usage.cache_write_tokens, model.cost_per_1m_out_cached)
}

/// Format a cost for status display.
#[must_use]
pub fn format_cost(usd: f64) -> String {
    if usd > 0.0 && usd < 0.0001 {
        "<$0.0001".to_string()
    } else {
        format!("${usd:.4}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DEEPSEEK_CHAT, ModelRegistry};

    #[test]
    fn cost_scales_per_million_tokens() {
        let model = ModelRegistry::builtin()
            .get(DEEPSEEK_CHAT)
            .expect("deepseek-chat");
        let cost = usage_cost(model, &TokenUsage::new(1_000_000, 1_000_000));
        assert!((cost - (0.27 + 1.10)).abs() < 1e-9);
    }

    #[test]
    fn free_models_cost_nothing() {
        let cost = usage_cost(&Model::mock(), &TokenUsage::new(5_000, 5_000));
        assert_eq!(cost, 0.0);
        assert_eq!(format_cost(cost), "$0.0000");
        assert_eq!(format_cost(0.00001), "<$0.0001");
    }
}
