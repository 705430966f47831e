//! F-UJI evaluation service client

use crate::config::EnrichmentConfig;
use crate::enrichment::{EnrichmentError, EnrichmentResult};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

/// Something that can assess one identifier
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, doi: &str, use_datacite: bool) -> EnrichmentResult<Value>;
}

/// Body of an evaluation request
#[derive(Debug, Serialize)]
struct EvaluationRequest {
    object_identifier: String,
    test_debug: bool,
    use_datacite: bool,
}

/// HTTP client for the evaluation endpoint
pub struct EnrichmentClient {
    client: Client,
    config: EnrichmentConfig,
}

impl EnrichmentClient {
    pub fn new(config: EnrichmentConfig) -> EnrichmentResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EnrichmentError::Client(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            "Evaluation service at {} as {} (password {})",
            config.url,
            config.username,
            config.password_masked()
        );
        Ok(Self { client, config })
    }

    /// The URI sent to the service for `doi`
    pub fn object_identifier(&self, doi: &str) -> String {
        format!("{}{}", self.config.doi_resolver, doi)
    }

    /// Evaluate `doi`; `use_datacite` selects whether the service consults
    /// DataCite metadata
    pub async fn evaluate(&self, doi: &str, use_datacite: bool) -> EnrichmentResult<Value> {
        let request = EvaluationRequest {
            object_identifier: self.object_identifier(doi),
            test_debug: true,
            use_datacite,
        };
        debug!("Evaluating {} (use_datacite={})", doi, use_datacite);

        let response = self
            .client
            .post(&self.config.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EnrichmentError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        if !body.is_object() {
            return Err(EnrichmentError::InvalidResponse(format!(
                "expected a JSON object for {}, got {}",
                doi, body
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl Evaluator for EnrichmentClient {
    async fn evaluate(&self, doi: &str, use_datacite: bool) -> EnrichmentResult<Value> {
        EnrichmentClient::evaluate(self, doi, use_datacite).await
    }
}
