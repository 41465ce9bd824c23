//! The unary call entry point.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::call::{self, PendingCall};
use crate::codec;
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::metadata;
use crate::schema::SchemaRegistry;

/// Everything needed to issue one unary call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub service: String,
    pub method: String,
    pub request_type: String,
    pub response_type: String,
    pub payload: Value,
    /// Falls back to the client's default timeout.
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
            payload,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A gRPC client bound to one server and one credential.
///
/// Calls share one HTTP/2 connection, opened on first use. Each call gets
/// its own stream, deadline and result; a failed call never affects the
/// others. Clones share the connection.
#[derive(Debug, Clone)]
pub struct GrpcClient {
    config: Arc<ClientConfig>,
    schema: SchemaRegistry,
    connections: Arc<ConnectionManager>,
}

impl GrpcClient {
    /// Create a client. Does not connect.
    pub fn new(config: ClientConfig, schema: SchemaRegistry) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            connections: Arc::new(ConnectionManager::new(config.clone())),
            config,
            schema,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Unary call with the default timeout.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        request_type: &str,
        response_type: &str,
        payload: &Value,
    ) -> Result<Value> {
        self.call_with_timeout(
            service,
            method,
            request_type,
            response_type,
            payload,
            self.config.timeout,
        )
        .await
    }

    /// Unary call: encode `payload` as `request_type`, send it to
    /// `/{service}/{method}`, and decode the reply as `response_type`.
    ///
    /// A response with no message yields `{}`. Dropping the future cancels
    /// the call's stream.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        request_type: &str,
        response_type: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value> {
        let request = self.schema.lookup(request_type)?;
        let response = self.schema.lookup(response_type)?;
        let body = codec::encode(&request, payload)?;

        let path = metadata::method_path(service, method);
        let headers = metadata::request_headers(&self.config, &path, timeout);

        let mut pending = PendingCall::new(response, timeout);
        let mut stream =
            call::before_deadline(&mut pending, self.connections.open_stream(headers, body)).await?;
        tracing::trace!(service, method, stream_id = stream.id(), "request sent");

        let outcome = pending.drive(&mut stream).await;
        match &outcome {
            Ok(_) => tracing::debug!(service, method, "call succeeded"),
            Err(e) => tracing::debug!(service, method, error = %e, "call failed"),
        }
        outcome
    }

    pub async fn invoke(&self, spec: &RequestSpec) -> Result<Value> {
        self.call_with_timeout(
            &spec.service,
            &spec.method,
            &spec.request_type,
            &spec.response_type,
            &spec.payload,
            spec.timeout.unwrap_or(self.config.timeout),
        )
        .await
    }

    /// Close the connection. Calls in flight fail with a transport error; a
    /// later call reconnects. Closing twice is a no-op.
    pub async fn close(&self) {
        self.connections.close().await;
    }
}
