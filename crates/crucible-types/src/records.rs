use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DirectiveStatus, ModelRequirements};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub requirements: ModelRequirements,
}

impl Role {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            system_prompt: system_prompt.into(),
            domain: None,
            requirements: ModelRequirements::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub directive_id: String,
    pub status: DirectiveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanditArm {
    pub id: String,
    pub pulls: u64,
    pub reward_sum: f64,
}

impl BanditArm {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pulls: 0,
            reward_sum: 0.0,
        }
    }

    /// `None` until the arm has been pulled at least once.
    pub fn mean(&self) -> Option<f64> {
        if self.pulls == 0 {
            return None;
        }
        Some(self.reward_sum / self.pulls as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_mean_is_undefined_without_pulls() {
        let mut arm = BanditArm::new("m-1");
        assert_eq!(arm.mean(), None);
        arm.pulls = 4;
        arm.reward_sum = 3.0;
        assert_eq!(arm.mean(), Some(0.75));
    }
}
