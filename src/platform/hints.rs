//! Hint cost policy
//!
//! Free hints are always collected. Hints with a cost are skipped unless the
//! config allows spending points and the cost is within `max_cost`.

use tracing::{info, warn};

use super::PlatformGateway;
use crate::challenge::HintRef;
use crate::config::HintConfig;

#[derive(Debug, Clone, Default)]
pub struct HintPolicy {
    allow_cost_hints: bool,
    max_cost: u64,
}

impl HintPolicy {
    pub fn new(config: &HintConfig) -> Self {
        Self {
            allow_cost_hints: config.allow_cost_hints,
            max_cost: config.max_cost,
        }
    }

    pub fn permits(&self, hint: &HintRef) -> bool {
        hint.cost == 0 || (self.allow_cost_hints && hint.cost <= self.max_cost)
    }

    /// Collect the content of every permitted hint. Failures are logged and skipped.
    pub async fn collect(&self, gateway: &dyn PlatformGateway, hints: &[HintRef]) -> Vec<String> {
        let mut out = Vec::new();
        for hint in hints {
            if !self.permits(hint) {
                info!("Skipping hint {} (cost {})", hint.id, hint.cost);
                continue;
            }
            if let Some(content) = hint.content.as_ref().filter(|c| !c.trim().is_empty()) {
                out.push(content.clone());
                continue;
            }
            match gateway.hint_content(hint.id, hint.cost > 0).await {
                Ok(Some(content)) => out.push(content),
                Ok(None) => {}
                Err(e) => warn!("Failed to fetch hint {}: {}", hint.id, e),
            }
        }
        out
    }

    /// Render hints as numbered markdown sections, `None` if there are none
    pub fn format(hints: &[String]) -> Option<String> {
        if hints.is_empty() {
            return None;
        }
        Some(
            hints
                .iter()
                .enumerate()
                .map(|(i, h)| format!("### Hint {}\n{}", i + 1, h.trim()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }
}
