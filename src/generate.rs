//! The external natural-language-to-SQL step, behind a trait so the
//! correction loop and its tests stay deterministic.

use crate::{
    error::{Result, ServiceError},
    knowledge::{render_context, KnowledgeItem},
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Input to one generation call. On correction rounds `failed_sql` and
/// `error` carry the previous attempt so the generator can do better.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub schema_metadata: &'a str,
    pub knowledge_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_sql: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
}

impl<'a> GenerationRequest<'a> {
    pub fn new(question: &'a str, schema_metadata: &'a str, knowledge: &[KnowledgeItem]) -> Self {
        Self {
            question,
            schema_metadata,
            knowledge_context: render_context(knowledge),
            failed_sql: None,
            error: None,
        }
    }

    pub fn with_failure(mut self, failed_sql: &'a str, error: &'a str) -> Self {
        self.failed_sql = Some(failed_sql);
        self.error = Some(error);
        self
    }
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String>;
}

/// Generation step hosted behind a sidecar HTTP endpoint.
pub struct HttpSqlGenerator {
    client: Client,
    url: String,
}

impl HttpSqlGenerator {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ServiceError::Config(format!("generator client rejected: {err}")))?;
        Ok(Self { client, url })
    }
}

#[derive(Deserialize)]
struct GenerationResponse {
    sql: String,
}

#[async_trait]
impl SqlGenerator for HttpSqlGenerator {
    async fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/generate", self.url.trim_end_matches('/')))
            .json(request)
            .send()
            .await
            .map_err(|err| ServiceError::Internal(anyhow::anyhow!("generation call failed: {err}")))?;

        if response.status() != StatusCode::OK {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "generation step returned status {}",
                response.status()
            )));
        }

        let body: GenerationResponse = response
            .json()
            .await
            .map_err(|err| ServiceError::Internal(anyhow::anyhow!("generation response invalid: {err}")))?;

        if body.sql.trim().is_empty() {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "generation step returned empty SQL"
            )));
        }
        Ok(body.sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_rounds_carry_the_failure() {
        let request = GenerationRequest::new("total orders", "orders(id, total)", &[])
            .with_failure("SELECT cnt(*) FROM orders", "function cnt(*) does not exist");
        assert_eq!(request.failed_sql, Some("SELECT cnt(*) FROM orders"));
        let serialized = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(
            serialized["error"],
            serde_json::json!("function cnt(*) does not exist")
        );
    }

    #[test]
    fn first_round_omits_failure_fields() {
        let request = GenerationRequest::new("total orders", "orders(id, total)", &[]);
        let serialized = serde_json::to_value(&request).expect("request should serialize");
        assert!(serialized.get("failed_sql").is_none());
    }
}
