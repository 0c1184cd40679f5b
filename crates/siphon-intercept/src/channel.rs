//! Instrumentation channel of the embedded browsing surface.
//!
//! The surface pauses every exchange twice, once before the request leaves
//! and once when response headers arrive, and waits for exactly one command
//! per pause: continue, fail or fulfill.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siphon_core::{Body, Headers};

use crate::error::{InterceptError, Result};

/// Point at which an exchange was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Request,
    Response,
}

/// Resource type reported by the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourceType {
    /// Top-level navigation.
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Xhr,
    Fetch,
    #[default]
    Other,
}

/// A paused exchange as delivered by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausedExchange {
    pub exchange_id: String,
    pub stage: Stage,
    pub method: String,
    pub url: String,
    pub request_headers: Headers,
    #[serde(default)]
    pub post_data: Option<String>,
    #[serde(default)]
    pub response_headers: Option<Headers>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub resource_type: ResourceType,
}

impl PausedExchange {
    /// A request-stage pause.
    pub fn request(
        exchange_id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        request_headers: Headers,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            stage: Stage::Request,
            method: method.into(),
            url: url.into(),
            request_headers,
            post_data: None,
            response_headers: None,
            status_code: None,
            resource_type: ResourceType::Other,
        }
    }

    /// The response-stage pause of the same exchange.
    pub fn into_response(mut self, status_code: u16, response_headers: Headers) -> Self {
        self.stage = Stage::Response;
        self.status_code = Some(status_code);
        self.response_headers = Some(response_headers);
        self
    }

    pub fn with_post_data(mut self, data: impl Into<String>) -> Self {
        self.post_data = Some(data.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }
}

/// Commands accepted by the browsing surface.
#[async_trait]
pub trait InstrumentationChannel: Send + Sync {
    /// Lets the exchange proceed unchanged.
    async fn continue_exchange(&self, exchange_id: &str) -> Result<()>;

    /// Aborts the exchange with a network error.
    async fn fail(&self, exchange_id: &str, reason: &str) -> Result<()>;

    /// Answers the exchange with a synthesized response.
    async fn fulfill(
        &self,
        exchange_id: &str,
        status_code: u16,
        headers: &Headers,
        body: &Body,
    ) -> Result<()>;

    /// Body of a response-stage exchange.
    async fn fetch_body(&self, exchange_id: &str) -> Result<Body>;

    /// Releases the surface. Called once when the dispatcher lets go.
    async fn detach(&self) {}
}

/// A channel that turns into a no-op once detached.
///
/// Commands racing a detach are dropped instead of erroring; body fetches
/// report a protocol error since there is nothing to return.
pub struct AttachedChannel {
    inner: Arc<dyn InstrumentationChannel>,
    detached: AtomicBool,
}

impl AttachedChannel {
    pub fn new(inner: Arc<dyn InstrumentationChannel>) -> Self {
        Self {
            inner,
            detached: AtomicBool::new(false),
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Marks the channel detached and releases the surface. Idempotent.
    pub async fn release(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.inner.detach().await;
        }
    }

    fn dropped(&self, command: &str, exchange_id: &str) -> bool {
        if self.is_detached() {
            tracing::debug!("Dropping {} for {} on detached channel", command, exchange_id);
            return true;
        }
        false
    }
}

#[async_trait]
impl InstrumentationChannel for AttachedChannel {
    async fn continue_exchange(&self, exchange_id: &str) -> Result<()> {
        if self.dropped("continue", exchange_id) {
            return Ok(());
        }
        self.inner.continue_exchange(exchange_id).await
    }

    async fn fail(&self, exchange_id: &str, reason: &str) -> Result<()> {
        if self.dropped("fail", exchange_id) {
            return Ok(());
        }
        self.inner.fail(exchange_id, reason).await
    }

    async fn fulfill(
        &self,
        exchange_id: &str,
        status_code: u16,
        headers: &Headers,
        body: &Body,
    ) -> Result<()> {
        if self.dropped("fulfill", exchange_id) {
            return Ok(());
        }
        self.inner.fulfill(exchange_id, status_code, headers, body).await
    }

    async fn fetch_body(&self, exchange_id: &str) -> Result<Body> {
        if self.is_detached() {
            return Err(InterceptError::Protocol(format!(
                "channel detached before body of {} was read",
                exchange_id
            )));
        }
        self.inner.fetch_body(exchange_id).await
    }

    async fn detach(&self) {
        self.release().await;
    }
}
