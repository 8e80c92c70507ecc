//! Token usage figures reported by meters and the limiter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Input and output token totals for one policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens.saturating_add(rhs.input_tokens),
            output_tokens: self.output_tokens.saturating_add(rhs.output_tokens),
        }
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Usage {
        iter.fold(Usage::default(), |acc, u| acc + u)
    }
}

/// Which counter tripped a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Input,
    Output,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Input => "input",
            TokenKind::Output => "output",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage merged across every evaluated meter, for reporting to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedUsage {
    /// Highest input total seen across meters
    pub input_tokens: u64,
    /// Highest output total seen across meters
    pub output_tokens: u64,
    /// Usage per policy description ("daily", "monthly", ...)
    pub periods: BTreeMap<String, Usage>,
    /// Output tokens held by live reservations, once admission looked at them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_reserved_tokens: Option<u64>,
    /// Size of the reservation the admission would create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_reservation_amount: Option<u64>,
    /// Current output + reserved + new reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_with_reservation: Option<u64>,
}

impl ConsolidatedUsage {
    /// Fold one meter's usage into the snapshot.
    pub fn merge(&mut self, description: &str, usage: Usage) {
        self.input_tokens = self.input_tokens.max(usage.input_tokens);
        self.output_tokens = self.output_tokens.max(usage.output_tokens);
        self.periods.insert(description.to_string(), usage);
    }

    /// Usage recorded under a policy description, zero when absent.
    pub fn period(&self, description: &str) -> Usage {
        self.periods.get(description).copied().unwrap_or_default()
    }
}
