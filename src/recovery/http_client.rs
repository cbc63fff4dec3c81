use super::{JobEvent, RecoveryService, RecoveryServiceError, StartJobRequest};
use crate::models::CapacityReport;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct StartJobResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct DescribeJobResponse {
    events: Vec<JobEvent>,
}

/// JSON-over-HTTP client for the recovery service.
#[derive(Clone)]
pub struct HttpRecoveryService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpRecoveryService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RecoveryServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecoveryServiceError::Service(format!("failed to build client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, e: reqwest::Error) -> RecoveryServiceError {
        if e.is_timeout() {
            RecoveryServiceError::Timeout(self.timeout)
        } else {
            RecoveryServiceError::Service(e.to_string())
        }
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, RecoveryServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecoveryServiceError::Service(format!("HTTP {}: {}", status, body)));
        }
        response.json::<T>().await.map_err(|e| self.transport_error(e))
    }
}

#[async_trait::async_trait]
impl RecoveryService for HttpRecoveryService {
    async fn start_job(&self, request: &StartJobRequest) -> Result<String, RecoveryServiceError> {
        let response = self
            .client
            .post(self.url("/jobs"))
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let body = response.text().await.unwrap_or_default();
            return Err(RecoveryServiceError::InvalidServer(body));
        }

        let started: StartJobResponse = self.read_json(response).await?;
        Ok(started.job_id)
    }

    async fn describe_job(&self, job_id: &str) -> Result<Vec<JobEvent>, RecoveryServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{}/events", job_id)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let described: DescribeJobResponse = self.read_json(response).await?;
        Ok(described.events)
    }

    async fn terminate_instances(&self, server_ids: &[String]) -> Result<(), RecoveryServiceError> {
        let response = self
            .client
            .post(self.url("/instances/terminate"))
            .json(&serde_json::json!({ "server_ids": server_ids }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(RecoveryServiceError::Service(format!(
                "terminate returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn capacity(&self) -> Result<CapacityReport, RecoveryServiceError> {
        let response = self
            .client
            .get(self.url("/capacity"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        self.read_json(response).await
    }
}
