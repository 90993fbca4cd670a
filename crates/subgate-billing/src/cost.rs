use subgate_core::MediaPrices;
use subgate_protocol::ClaudeUsage;

/// Cost of one forward, split by billing dimension. Values are USD.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
    pub media: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input + self.output + self.cache_creation + self.cache_read + self.media
    }
}

/// Price resolution is an external concern (model price tables live with
/// the billing service); the recorder only needs the breakdown.
pub trait CostModel: Send + Sync {
    fn compute(
        &self,
        model: &str,
        usage: &ClaudeUsage,
        media: Option<(&str, u32, &MediaPrices)>,
    ) -> CostBreakdown;
}

/// Flat per-MTok pricing: the default model when no external price table is
/// wired in. Cache writes bill at the 1.25×/2× ladder, cache reads at 10%.
#[derive(Debug, Clone, Copy)]
pub struct TokenPriceModel {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for TokenPriceModel {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

impl CostModel for TokenPriceModel {
    fn compute(
        &self,
        _model: &str,
        usage: &ClaudeUsage,
        media: Option<(&str, u32, &MediaPrices)>,
    ) -> CostBreakdown {
        const MTOK: f64 = 1_000_000.0;
        let media_cost = match media {
            Some(("image", count, prices)) => prices.image_price * count as f64,
            Some(("video", count, prices)) => prices.video_price * count as f64,
            _ => 0.0,
        };
        CostBreakdown {
            input: usage.input_tokens as f64 / MTOK * self.input_per_mtok,
            output: usage.output_tokens as f64 / MTOK * self.output_per_mtok,
            cache_creation: (usage.cache_creation_5m_tokens as f64 * 1.25
                + usage.cache_creation_1h_tokens as f64 * 2.0)
                / MTOK
                * self.input_per_mtok,
            cache_read: usage.cache_read_input_tokens as f64 / MTOK * self.input_per_mtok * 0.1,
            media: media_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_buckets_price_differently() {
        let model = TokenPriceModel::default();
        let five_m = model.compute(
            "claude-sonnet-4-5",
            &ClaudeUsage {
                cache_creation_input_tokens: 1_000_000,
                cache_creation_5m_tokens: 1_000_000,
                ..Default::default()
            },
            None,
        );
        let one_h = model.compute(
            "claude-sonnet-4-5",
            &ClaudeUsage {
                cache_creation_input_tokens: 1_000_000,
                cache_creation_1h_tokens: 1_000_000,
                ..Default::default()
            },
            None,
        );
        assert!(one_h.cache_creation > five_m.cache_creation);
    }
}
