//! Client for the external transaction-intent classifier.
//!
//! Thin contract: POST the transaction's shape, get back an intent label
//! with a confidence. Predictions are cached by signature for an hour;
//! a classifier outage degrades to `{unknown, 0}` without caching, so a
//! recovered service starts answering again immediately.

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::upstream::ParsedTransaction;

/// Prediction cache lifetime.
const PREDICTION_TTL: Duration = Duration::from_secs(3600);
/// Classifier call timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Intent labels the classifier may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Transfer,
    Trading,
    Arbitrage,
    Bridging,
    YieldFarming,
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Transfer => "transfer",
            Intent::Trading => "trading",
            Intent::Arbitrage => "arbitrage",
            Intent::Bridging => "bridging",
            Intent::YieldFarming => "yield_farming",
            Intent::Unknown => "unknown",
        }
    }
}

/// One prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPrediction {
    pub intent: Intent,
    /// In [0, 1]
    pub confidence: f64,
}

impl IntentPrediction {
    fn unknown() -> Self {
        Self { intent: Intent::Unknown, confidence: 0.0 }
    }
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    signature: &'a str,
    instructions: &'a [serde_json::Value],
    accounts: &'a [String],
    fee: u64,
}

/// Cached client for the inference service.
pub struct IntentClient {
    http: reqwest::Client,
    base_url: String,
    cache: Cache<String, IntentPrediction>,
}

impl IntentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(PREDICTION_TTL)
                .build(),
        }
    }

    /// Predict the intent of one transaction.
    pub async fn predict(&self, tx: &ParsedTransaction) -> IntentPrediction {
        if let Some(cached) = self.cache.get(&tx.signature).await {
            return cached;
        }

        let request = PredictRequest {
            signature: &tx.signature,
            instructions: &tx.instructions,
            accounts: &tx.accounts,
            fee: tx.fee,
        };

        let url = format!("{}/predict", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await;

        let prediction = match response {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<IntentPrediction>().await {
                    Ok(p) => {
                        let p = IntentPrediction {
                            intent: p.intent,
                            confidence: p.confidence.clamp(0.0, 1.0),
                        };
                        self.cache.insert(tx.signature.clone(), p.clone()).await;
                        p
                    }
                    Err(e) => {
                        warn!(signature = %tx.signature, error = %e, "intent response unreadable");
                        IntentPrediction::unknown()
                    }
                }
            }
            Ok(resp) => {
                warn!(signature = %tx.signature, status = %resp.status(), "intent service error");
                IntentPrediction::unknown()
            }
            Err(e) => {
                warn!(signature = %tx.signature, error = %e, "intent service unreachable");
                IntentPrediction::unknown()
            }
        };
        prediction
    }

    /// Fan out predictions for a batch, preserving order.
    pub async fn predict_batch(&self, txs: &[ParsedTransaction]) -> Vec<IntentPrediction> {
        futures::future::join_all(txs.iter().map(|tx| self.predict(tx))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_labels_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(Intent::YieldFarming).unwrap(),
            serde_json::json!("yield_farming")
        );
        let parsed: Intent = serde_json::from_value(serde_json::json!("arbitrage")).unwrap();
        assert_eq!(parsed, Intent::Arbitrage);
    }

    #[tokio::test]
    async fn unreachable_service_degrades_to_unknown() {
        // Port 1 refuses connections immediately.
        let client = IntentClient::new("http://127.0.0.1:1");
        let tx = ParsedTransaction {
            signature: "sig".into(),
            block_time: None,
            slot: 0,
            fee: 5000,
            success: true,
            accounts: vec!["a".into()],
            instructions: vec![],
        };
        let prediction = client.predict(&tx).await;
        assert_eq!(prediction.intent, Intent::Unknown);
        assert_eq!(prediction.confidence, 0.0);
        // The failure was not cached.
        assert!(client.cache.get("sig").await.is_none());
    }
}
