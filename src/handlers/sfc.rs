//! SFC (Shop Floor Control) upload handler.
//!
//! SFC is the external MES web service that ingests manufacturing records.
//! The handler assembles the request payload from the point's parameters,
//! invokes the [`SfcClient`] port, and persists every exchange to the SFC
//! log for traceability, failures included.

use super::{MeasurementHandler, PointContext};
use crate::error::{PdtError, PdtResult};
use crate::model::UPSTREAM_VALUE_KEY;
use crate::storage::SfcLogEntry;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Outcome of one SFC call.
#[derive(Debug, Clone)]
pub struct SfcResponse {
    /// Status string reported by the service (the measured value)
    pub status: String,
    /// Whether the service accepted the record
    pub ok: bool,
    /// Raw response body
    pub body: String,
}

/// MES service client port.
#[async_trait]
pub trait SfcClient: Send + Sync {
    /// Invoke one SFC operation.
    async fn call(
        &self,
        operation: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> PdtResult<SfcResponse>;
}

/// HTTP client against the real SFC service.
pub struct HttpSfcClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSfcClient {
    /// Target the service at `base_url` (operation appended as the path).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SfcClient for HttpSfcClient {
    async fn call(
        &self,
        operation: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> PdtResult<SfcResponse> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), operation);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| PdtError::Sfc(format!("{operation}: {e}")))?;

        let ok = response.status().is_success();
        let body = response
            .text()
            .await
            .map_err(|e| PdtError::Sfc(format!("{operation}: read body: {e}")))?;

        // The service answers either a bare status string or a JSON object
        // with a `status` field.
        let status = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string))
            .unwrap_or_else(|| body.trim().to_string());

        Ok(SfcResponse { status, ok, body })
    }
}

/// Client used when no SFC service is configured: every call fails so SFC
/// points surface as per-point ERROR rather than silently passing.
pub struct UnconfiguredSfcClient;

#[async_trait]
impl SfcClient for UnconfiguredSfcClient {
    async fn call(
        &self,
        operation: &str,
        _payload: &serde_json::Value,
        _timeout: Duration,
    ) -> PdtResult<SfcResponse> {
        Err(PdtError::Sfc(format!(
            "{operation}: SFC service not configured"
        )))
    }
}

/// Scripted SFC client for tests and bench stations.
pub struct MockSfcClient {
    status: String,
    ok: bool,
}

impl MockSfcClient {
    /// Always answers `status` with the given acceptance flag.
    pub fn new(status: impl Into<String>, ok: bool) -> Self {
        Self {
            status: status.into(),
            ok,
        }
    }

    /// Accepting client answering "PASS".
    pub fn passing() -> Self {
        Self::new("PASS", true)
    }
}

#[async_trait]
impl SfcClient for MockSfcClient {
    async fn call(
        &self,
        _operation: &str,
        _payload: &serde_json::Value,
        _timeout: Duration,
    ) -> PdtResult<SfcResponse> {
        Ok(SfcResponse {
            status: self.status.clone(),
            ok: self.ok,
            body: self.status.clone(),
        })
    }
}

/// The SFC upload handler.
pub struct SfcHandler {
    operation: String,
    payload: serde_json::Value,
}

impl SfcHandler {
    /// New, payload assembled in prepare.
    pub fn new() -> Self {
        Self {
            operation: String::new(),
            payload: serde_json::Value::Null,
        }
    }
}

impl Default for SfcHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementHandler for SfcHandler {
    async fn prepare(&mut self, ctx: &mut PointContext) -> PdtResult<()> {
        self.operation = ctx.require("Operation")?.to_string();

        let mut payload = serde_json::Map::new();
        payload.insert(
            "serial_number".to_string(),
            serde_json::Value::String(ctx.serial_number.clone()),
        );
        for (key, value) in &ctx.params {
            if key == "Operation" || key == UPSTREAM_VALUE_KEY {
                continue;
            }
            payload.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        if let Some(upstream) = &ctx.upstream {
            payload.insert(
                "upstream_value".to_string(),
                serde_json::Value::String(upstream.clone()),
            );
        }
        self.payload = serde_json::Value::Object(payload);
        Ok(())
    }

    async fn execute(&mut self, ctx: &mut PointContext) -> PdtResult<String> {
        ctx.check_cancel()?;
        let result = ctx
            .sfc
            .call(&self.operation, &self.payload, ctx.timeout)
            .await;

        let (response, ok, outcome) = match result {
            Ok(response) => {
                let ok = response.ok;
                (response.body.clone(), ok, Ok(response.status))
            }
            Err(e) => (e.to_string(), false, Err(e)),
        };

        let entry = SfcLogEntry {
            session_id: ctx.session_id,
            operation: self.operation.clone(),
            request: self.payload.clone(),
            response,
            ok,
            at: Utc::now(),
        };
        if let Err(e) = ctx.repository.save_sfc_log(&entry).await {
            tracing::warn!(error = %e, "failed to persist SFC log entry");
        }

        match outcome {
            Ok(status) if ok => Ok(status),
            Ok(status) => Err(PdtError::Sfc(format!(
                "{}: service rejected record ({status})",
                self.operation
            ))),
            Err(e) => Err(e),
        }
    }

    async fn cleanup(&mut self, _ctx: &mut PointContext) -> PdtResult<()> {
        Ok(())
    }
}
