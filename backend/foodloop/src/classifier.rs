//! Client for the ML service that predicts a listing's meal category.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::models::{FoodCategory, Storage};

#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    async fn predict(&self, description: &str, hours_old: f64, storage: Storage) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    category: String,
}

pub struct MlClassifier {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl MlClassifier {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Classifier for MlClassifier {
    /// `POST {base}/predict`
    async fn predict(&self, description: &str, hours_old: f64, storage: Storage) -> Result<String> {
        let body: PredictResponse = self
            .client
            .post(format!("{}/predict", self.base_url))
            .timeout(self.timeout)
            .json(&json!({
                "food": description,
                "hours_old": hours_old,
                "storage": storage.as_str(),
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.category)
    }
}

/// Predict a category, falling back to `Other` when the service fails.
pub async fn categorize(
    classifier: &dyn Classifier,
    description: &str,
    hours_old: f64,
    storage: Storage,
) -> FoodCategory {
    match classifier.predict(description, hours_old, storage).await {
        Ok(label) => {
            debug!("ML category for {description:?}: {label}");
            FoodCategory::from_label(&label)
        }
        Err(e) => {
            warn!("ML prediction failed, using \"other\": {e}");
            FoodCategory::Other
        }
    }
}
