use serde::{Deserialize, Serialize};

use reach_core::config::BudgetConfig;

/// Which limit stopped the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Iterations,
    Tokens,
    ToolCalls,
}

impl BudgetLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iterations => "iterations",
            Self::Tokens => "tokens",
            Self::ToolCalls => "tool_calls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exhausted {
    pub limit: BudgetLimit,
    pub used: u64,
    pub max: u64,
}

/// Per-run counters checked before every dispatch.
///
/// Iterations count every non-terminal step visit. A visit is blocked when
/// it would push a counter past its maximum. Tokens are only known after a
/// call returns, so a run that has already spent its token allowance is
/// blocked at the next visit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limits: BudgetConfig,
    pub iterations: u64,
    pub tokens: u64,
    pub tool_calls: u64,
}

impl Budget {
    pub fn new(limits: BudgetConfig) -> Self {
        Self {
            limits,
            ..Default::default()
        }
    }

    /// Check whether one more visit (and, for tool steps, one more call)
    /// fits. Counters are not touched.
    pub fn check(&self, tool_call: bool) -> Result<(), Exhausted> {
        if let Some(max) = self.limits.max_iterations {
            if self.iterations + 1 > max {
                return Err(Exhausted {
                    limit: BudgetLimit::Iterations,
                    used: self.iterations,
                    max,
                });
            }
        }
        if let Some(max) = self.limits.max_tokens {
            if self.tokens >= max {
                return Err(Exhausted {
                    limit: BudgetLimit::Tokens,
                    used: self.tokens,
                    max,
                });
            }
        }
        if tool_call {
            if let Some(max) = self.limits.max_tool_calls {
                if self.tool_calls + 1 > max {
                    return Err(Exhausted {
                        limit: BudgetLimit::ToolCalls,
                        used: self.tool_calls,
                        max,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn record_visit(&mut self) {
        self.iterations += 1;
    }

    pub fn record_tool_call(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_tokens(&mut self, tokens: u64) {
        self.tokens = self.tokens.saturating_add(tokens);
    }
}
