//! Admission gate (memory pressure) and token-budget gate. Both run before
//! any I/O so an overloaded or oversized request never reaches the store.

use sysinfo::System;

use crate::config::{MemoryConfig, TokenBudgetConfig};
use crate::errors::RouterError;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MemorySnapshot {
    pub free_mb: u64,
    pub min_required_mb: u64,
    pub healthy: bool,
}

pub struct MemoryGate {
    min_free_mb: u64,
}

impl MemoryGate {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            min_free_mb: config.min_free_ram_mb,
        }
    }

    /// Point-in-time read of available memory. A fresh `System` is cheap
    /// enough to build per call at the request rates this gate guards
    /// (one admission check per request, not a hot loop).
    pub fn snapshot(&self) -> MemorySnapshot {
        let mut system = System::new();
        system.refresh_memory();
        let free_mb = system.available_memory() / (1024 * 1024);
        MemorySnapshot {
            free_mb,
            min_required_mb: self.min_free_mb,
            healthy: free_mb >= self.min_free_mb,
        }
    }

    pub fn enforce(&self) -> Result<(), RouterError> {
        let snapshot = self.snapshot();
        if !snapshot.healthy {
            return Err(RouterError::LowMemory {
                free_mb: snapshot.free_mb,
            });
        }
        Ok(())
    }
}

/// `ceil((len(prompt)+3)/4)` — a cheap guardrail estimate, not a semantic
/// token count.
pub fn estimate_input_tokens(prompt: &str) -> u64 {
    ((prompt.len() as u64) + 3) / 4
}

pub fn enforce_token_ceiling(config: &TokenBudgetConfig, product: &str, prompt: &str) -> Result<(), RouterError> {
    let estimated = estimate_input_tokens(prompt);
    let ceiling = config.ceiling_for(product);
    if estimated > ceiling {
        return Err(RouterError::TokenCeilingExceeded {
            product: product.to_string(),
            estimated,
            ceiling,
        });
    }
    Ok(())
}

pub fn enforce_prompt_length(max_chars: usize, prompt: &str) -> Result<(), RouterError> {
    if prompt.chars().count() > max_chars {
        return Err(RouterError::PromptTooLong { max: max_chars });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn token_estimate_boundary_is_accepted_and_next_char_rejected() {
        let config = TokenBudgetConfig {
            max_prompt_chars: 16_000,
            ceilings: HashMap::new(),
            default_ceiling: 600,
        };
        // 600 tokens * 4 - 3 = 2397 chars estimates to exactly 600.
        let at_ceiling = "x".repeat(2397);
        assert!(enforce_token_ceiling(&config, "unknown", &at_ceiling).is_ok());
        let over_ceiling = "x".repeat(2398);
        assert!(enforce_token_ceiling(&config, "unknown", &over_ceiling).is_err());
    }

    #[test]
    fn prompt_length_boundary() {
        let at_max = "x".repeat(16_000);
        assert!(enforce_prompt_length(16_000, &at_max).is_ok());
        let over_max = "x".repeat(16_001);
        assert!(enforce_prompt_length(16_000, &over_max).is_err());
    }

    #[test]
    fn noid_ceiling_rejects_ten_thousand_char_prompt() {
        let mut ceilings = HashMap::new();
        ceilings.insert("noid".to_string(), 600);
        let config = TokenBudgetConfig {
            max_prompt_chars: 16_000,
            ceilings,
            default_ceiling: 600,
        };
        let prompt = "x".repeat(10_000);
        assert!(enforce_token_ceiling(&config, "noid", &prompt).is_err());
    }
}
