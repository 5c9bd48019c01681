//! Operator prompts
//!
//! Manual actions (patching fibres, switching the laser on) are confirmed through an
//! [`OperatorPrompt`]. The binary provides a console implementation; unattended runs
//! and tests use [`AutoConfirm`].

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::StationResult;

#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Show `message` and wait for the operator. `false` means the operator declined.
    async fn confirm(&self, message: &str) -> StationResult<bool>;
}

/// Confirms every prompt immediately and keeps a record of what was asked.
#[derive(Debug, Clone, Default)]
pub struct AutoConfirm {
    asked: Arc<Mutex<Vec<String>>>,
}

impl AutoConfirm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages confirmed so far, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl OperatorPrompt for AutoConfirm {
    async fn confirm(&self, message: &str) -> StationResult<bool> {
        info!(prompt = message, "Auto-confirmed");
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_confirm_records() {
        let prompt = AutoConfirm::new();
        assert!(prompt.confirm("Turn on laser").await.unwrap());
        assert_eq!(prompt.asked(), vec!["Turn on laser"]);
    }
}
