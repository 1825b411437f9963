use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelQuota {
    // Remaining quota, 0..=100.
    pub percentage: i32,
    #[serde(rename = "resetTime", default)]
    pub reset_time: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "maxTokenAllowed", default, skip_serializing_if = "Option::is_none")]
    pub max_token_allowed: Option<u32>,
    #[serde(
        rename = "maxCompletionTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_completion_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaData {
    #[serde(default)]
    pub models: BTreeMap<String, ModelQuota>,
    #[serde(default)]
    pub last_updated: i64,
}

impl QuotaData {
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            last_updated: chrono::Utc::now().timestamp(),
        }
    }

    pub fn add_model(&mut self, name: String, percentage: i32, reset_time: String) {
        self.models.insert(
            name,
            ModelQuota {
                percentage: percentage.clamp(0, 100),
                reset_time,
                display_name: None,
                max_token_allowed: None,
                max_completion_tokens: None,
            },
        );
    }

    // Absent model entries carry zero weight, so an empty map averages to 0.
    pub fn avg_percentage(&self) -> f32 {
        if self.models.is_empty() {
            return 0.0;
        }
        let sum: i32 = self.models.values().map(|m| m.percentage).sum();
        sum as f32 / self.models.len() as f32
    }
}
