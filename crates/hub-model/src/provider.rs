// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::{ModelRequest, ModelResponse};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-retryable HTTP status (or a retryable one after retries ran out).
    #[error("provider http error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider network error: {0}")]
    Network(String),

    /// The cancellation token fired while the call (or a backoff sleep)
    /// was in flight.
    #[error("provider call canceled")]
    Canceled,

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("API key not set; provide LLM_API_KEY or a per-agency override")]
    MissingApiKey,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

/// Callback invoked with each incremental text chunk during [`Provider::stream`].
pub type DeltaFn<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Uniform contract over a chat-completions style model service.
///
/// Implementations must honor `cancel`: an already-cancelled token aborts
/// before any network activity, and a token cancelled mid-call surfaces
/// [`ProviderError::Canceled`] rather than a partial result.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable driver name for logs.
    fn name(&self) -> &str;

    /// Single blocking call: returns the complete assistant message.
    async fn invoke(
        &self,
        req: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError>;

    /// Like [`invoke`](Provider::invoke) but emits incremental text chunks
    /// through `on_delta` before resolving with the full message.
    ///
    /// The default implementation performs a plain invoke and emits the
    /// final text as one chunk — correct for drivers without a streaming
    /// wire format.
    async fn stream(
        &self,
        req: &ModelRequest,
        on_delta: DeltaFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let resp = self.invoke(req, cancel).await?;
        if let Some(text) = resp.message.text_content() {
            on_delta(&text);
        }
        Ok(resp)
    }
}
