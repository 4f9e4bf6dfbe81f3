//! Monitoring service REST adapter
//!
//! `POST /api/v1/monitors` creates a check and answers with its id (either
//! `{"id": ..}` or `{"data": {"id": ..}}`), `PUT` and `DELETE` on
//! `/api/v1/monitors/{id}` overwrite and remove it.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::MonitoringConfig;
use crate::error::{ExternalOperation, OperatorError, Result};
use crate::monitoring::{DeleteOutcome, MonitorRequest, MonitoringService};

const MONITORS_PATH: &str = "/api/v1/monitors";

#[derive(Clone)]
pub struct HttpMonitoringClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
    dry_run: bool,
}

impl HttpMonitoringClient {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
        dry_run: bool,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("routewatch/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                OperatorError::Internal(format!("failed to build monitoring HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.filter(|t| !t.is_empty()),
            dry_run,
        })
    }

    pub fn from_config(config: &MonitoringConfig) -> Result<Self> {
        Self::new(
            &config.base_url,
            config.api_token.clone(),
            Duration::from_secs(config.timeout_secs),
            config.dry_run,
        )
    }

    fn monitor_url(&self, id: &str) -> String {
        format!(
            "{}{}/{}",
            self.base_url,
            MONITORS_PATH,
            urlencoding::encode(id)
        )
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header(ACCEPT, "application/json");
        match &self.api_token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn send(
        &self,
        req: RequestBuilder,
        operation: ExternalOperation,
        subject: &str,
    ) -> Result<Response> {
        self.authorize(req)
            .send()
            .await
            .map_err(|e| OperatorError::external(operation, subject, e.to_string()))
    }

    /// Turn a non-success response into `OperatorError::External`
    async fn check(
        resp: Response,
        operation: ExternalOperation,
        subject: &str,
    ) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(OperatorError::External {
            operation,
            subject: subject.to_string(),
            status: Some(status.as_u16()),
            message: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        })
    }

    fn extract_id(body: &Value) -> Option<String> {
        let id = body
            .get("id")
            .or_else(|| body.get("data").and_then(|d| d.get("id")))?;
        match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[async_trait]
impl MonitoringService for HttpMonitoringClient {
    async fn create(&self, request: &MonitorRequest) -> Result<String> {
        if self.dry_run {
            let id = format!("dry-run-{}", uuid::Uuid::new_v4());
            info!(name = %request.name, target = %request.target, id = %id, "[DRY RUN] Would create monitor");
            return Ok(id);
        }

        let url = format!("{}{}", self.base_url, MONITORS_PATH);
        let op = ExternalOperation::Create;
        let resp = self
            .send(self.http.post(&url).json(request), op, &request.name)
            .await?;
        let resp = Self::check(resp, op, &request.name).await?;
        let body: Value = resp.json().await.map_err(|e| {
            OperatorError::external(op, &request.name, format!("invalid response body: {}", e))
        })?;

        let id = Self::extract_id(&body).ok_or_else(|| {
            OperatorError::external(op, &request.name, format!("response carries no id: {}", body))
        })?;
        debug!(name = %request.name, id = %id, "Monitor created remotely");
        Ok(id)
    }

    async fn update(&self, id: &str, request: &MonitorRequest) -> Result<()> {
        if self.dry_run {
            info!(id, target = %request.target, "[DRY RUN] Would update monitor");
            return Ok(());
        }

        let req = self.http.put(self.monitor_url(id)).json(request);
        let resp = self.send(req, ExternalOperation::Update, id).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(OperatorError::ExternalNotFound {
                operation: ExternalOperation::Update,
                id: id.to_string(),
            });
        }
        Self::check(resp, ExternalOperation::Update, id).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        if self.dry_run {
            info!(id, "[DRY RUN] Would delete monitor");
            return Ok(DeleteOutcome::Deleted);
        }

        let resp = self
            .send(self.http.delete(self.monitor_url(id)), ExternalOperation::Delete, id)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        Self::check(resp, ExternalOperation::Delete, id).await?;
        Ok(DeleteOutcome::Deleted)
    }
}
