//! Generic exponential-backoff-with-jitter retry decorator (spec §4.2,
//! component C4).
//!
//! No precedent in the teacher crate at all — it has no retry layer.
//! Grounded on the corpus-wide precedent of decorator-style retry wrapped
//! around a chat client (several `examples/other_examples/` agent loops
//! wrap their LLM client in a `backoff`-shaped config struct before
//! calling it). [`RetryingClient`]/[`RetryingChat`] wrap anything
//! implementing [`super::gateway::Client`]/[`super::gateway::ChatSession`]
//! and add retry plus the streaming→non-streaming fallback spec §4.2
//! describes.

use super::gateway::{ChatSession, Client, SendContent};
use super::{ChatResponse, CompletionResponse, FunctionDefinition, ProviderError, StreamChunk};
use crate::schema::Schema;
use futures::{Stream, StreamExt};
use log::{debug, error, warn};
use rand::Rng;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `{max_attempts, initial_backoff, max_backoff, backoff_factor, jitter}`
/// (spec §4.2, verbatim field set).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: Duration::from_millis(100),
        }
    }
}

/// Sleeps `min(backoff, max_backoff) ± jitter`, racing the sleep against
/// `cancel` so a cancellation interrupts a pending backoff immediately
/// (spec §4.2: "Cancellation is checked both after the operation and
/// while sleeping").
async fn backoff_sleep(backoff: Duration, cfg: &RetryConfig, cancel: &CancellationToken) -> Result<(), ()> {
    let capped = backoff.min(cfg.max_backoff);
    let jitter_ms = if cfg.jitter.is_zero() {
        0
    } else {
        rand::thread_rng().gen_range(0..=cfg.jitter.as_millis() as u64)
    };
    let sleep_for = capped + Duration::from_millis(jitter_ms);

    tokio::select! {
        _ = tokio::time::sleep(sleep_for) => Ok(()),
        _ = cancel.cancelled() => Err(()),
    }
}

fn next_backoff(current: Duration, cfg: &RetryConfig) -> Duration {
    let millis = (current.as_millis() as f64 * cfg.backoff_factor) as u64;
    Duration::from_millis(millis).min(cfg.max_backoff)
}

/// Retries `op` per `cfg`, classifying retryability with `is_retryable`.
/// A cancellation during the operation or while sleeping returns
/// `ProviderError::Cancelled` rather than the last operation error (spec
/// §4.2).
async fn retry_with<T, F, Fut>(
    cfg: &RetryConfig,
    cancel: &CancellationToken,
    is_retryable: impl Fn(&ProviderError) -> bool,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut backoff = cfg.initial_backoff;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let result = tokio::select! {
            r = op() => r,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= cfg.max_attempts || !is_retryable(&err) {
                    error!("retry: giving up after {attempt} attempt(s): {err}");
                    return Err(err);
                }
                warn!("retry: attempt {attempt}/{} failed, backing off {backoff:?}: {err}", cfg.max_attempts);
                if backoff_sleep(backoff, cfg, cancel).await.is_err() {
                    return Err(ProviderError::Cancelled);
                }
                backoff = next_backoff(backoff, cfg);
            }
        }
    }
}

/// Decorates a [`Client`] with retry on `generate_completion`/
/// `list_models`, and hands out [`RetryingChat`]-wrapped sessions from
/// `start_chat`.
pub struct RetryingClient {
    inner: Box<dyn Client>,
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn Client>, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait::async_trait]
impl Client for RetryingClient {
    fn start_chat(&self, system_prompt: Option<String>) -> Box<dyn ChatSession> {
        let chat: Arc<dyn ChatSession> = Arc::from(self.inner.start_chat(system_prompt));
        Box::new(RetryingChat {
            inner: chat,
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        })
    }

    async fn generate_completion(&self, prompt: &str) -> Result<CompletionResponse, ProviderError> {
        retry_with(&self.config, &self.cancel, super::default_is_retryable, || {
            self.inner.generate_completion(prompt)
        })
        .await
    }

    fn set_response_schema(&self, schema: Option<Schema>) -> Result<(), ProviderError> {
        self.inner.set_response_schema(schema)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        retry_with(&self.config, &self.cancel, super::default_is_retryable, || {
            self.inner.list_models()
        })
        .await
    }
}

/// Decorates a [`ChatSession`]: `send` retries per `config`;
/// `send_streaming` retries connection setup, then falls back once to
/// `send` (wrapped in a one-element stream) if streaming keeps failing
/// with retryable errors (spec §4.2).
pub struct RetryingChat {
    inner: Arc<dyn ChatSession>,
    config: RetryConfig,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl ChatSession for RetryingChat {
    async fn send(&self, contents: Vec<SendContent>) -> Result<ChatResponse, ProviderError> {
        // `contents` is consumed on each call, but a retried attempt must
        // resend the exact same payload, so build owned retry-ready
        // copies up front instead of moving `contents` into the closure.
        let owned: Vec<OwnedSendContent> = contents.into_iter().map(OwnedSendContent::from).collect();
        retry_with(
            &self.config,
            &self.cancel,
            |e| self.inner.is_retryable_error(e),
            || {
                let batch: Vec<SendContent> = owned.iter().map(OwnedSendContent::to_send_content).collect();
                self.inner.send(batch)
            },
        )
        .await
    }

    async fn send_streaming(
        &self,
        contents: Vec<SendContent>,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
        let owned: Vec<OwnedSendContent> = contents.into_iter().map(OwnedSendContent::from).collect();

        let stream_result = retry_with(
            &self.config,
            &self.cancel,
            |e| self.inner.is_retryable_error(e),
            || {
                let batch: Vec<SendContent> = owned.iter().map(OwnedSendContent::to_send_content).collect();
                self.inner.send_streaming(batch)
            },
        )
        .await;

        let inner_stream = match stream_result {
            Ok(stream) => stream,
            Err(_) => {
                // Streaming connection setup exhausted its retries;
                // fall back once to the non-streaming Send and wrap the
                // single response in a one-element iterator (spec §4.2).
                debug!("retry: streaming exhausted its retries, falling back to a single non-streaming send");
                return non_streaming_fallback(&self.inner, &owned).await;
            }
        };

        // A mid-stream item error gets the same fallback treatment, but
        // must preserve whatever chunks already made it to the caller
        // (spec §4.2: "Mid-stream errors trigger the same fallback,
        // preserving already-yielded chunks") — the wrapper below forwards
        // every chunk as it arrives and only swaps to the fallback stream
        // the moment an `Err` item shows up.
        let inner = self.inner.clone();
        let wrapped = async_stream::stream! {
            let mut inner_stream = inner_stream;
            while let Some(item) = inner_stream.next().await {
                match item {
                    Ok(chunk) => yield Ok(chunk),
                    Err(err) if inner.is_retryable_error(&err) => {
                        debug!(
                            "retry: mid-stream error, falling back to a single non-streaming send, \
                             preserving already-yielded chunks: {err}"
                        );
                        match non_streaming_fallback(&inner, &owned).await {
                            Ok(mut fallback) => {
                                while let Some(fallback_item) = fallback.next().await {
                                    yield fallback_item;
                                }
                            }
                            Err(fallback_err) => yield Err(fallback_err),
                        }
                        return;
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(wrapped))
    }

    fn set_function_definitions(&self, defs: Vec<FunctionDefinition>) {
        self.inner.set_function_definitions(defs);
    }

    fn is_retryable_error(&self, err: &ProviderError) -> bool {
        self.inner.is_retryable_error(err)
    }

    fn history(&self) -> Vec<crate::provider::Message> {
        self.inner.history()
    }
}

/// Sends `contents` once, non-streaming, and wraps the response in a
/// one-element stream — the shared fallback shape spec §4.2 describes
/// both for exhausted connection-setup retries and for a mid-stream
/// error that can't be recovered by continuing to pull from the same
/// stream.
async fn non_streaming_fallback(
    inner: &Arc<dyn ChatSession>,
    contents: &[OwnedSendContent],
) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
    let batch: Vec<SendContent> = contents.iter().map(OwnedSendContent::to_send_content).collect();
    let response = inner.send(batch).await?;
    let text = response.first_candidate_text();
    let usage = response.usage.clone();
    let stream = async_stream::stream! {
        yield Ok(StreamChunk::Content(text.clone()));
        yield Ok(StreamChunk::Done {
            finish_reason: response.finish_reason.clone(),
            usage,
            full_content: text,
        });
    };
    Ok(Box::pin(stream))
}

/// Owned, retryable copy of a [`SendContent`] — `SendContent` is
/// move-only (it carries a `FunctionCallResult`), but a retried attempt
/// needs to resend the same contents more than once.
#[derive(Clone)]
enum OwnedSendContent {
    Text(String),
    ToolResult(super::FunctionCallResult),
}

impl From<SendContent> for OwnedSendContent {
    fn from(c: SendContent) -> Self {
        match c {
            SendContent::Text(t) => OwnedSendContent::Text(t),
            SendContent::ToolResult(r) => OwnedSendContent::ToolResult(r),
        }
    }
}

impl OwnedSendContent {
    fn to_send_content(&self) -> SendContent {
        match self {
            OwnedSendContent::Text(t) => SendContent::Text(t.clone()),
            OwnedSendContent::ToolResult(r) => SendContent::ToolResult(r.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn zero_attempts_worth_of_retry_returns_first_error_unchanged() {
        let cfg = RetryConfig {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter: Duration::from_millis(0),
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), ProviderError> = retry_with(&cfg, &cancel, |_| true, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Timeout)
            }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let cfg = RetryConfig::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), ProviderError> = retry_with(&cfg, &cancel, |_| false, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::ConfigError("bad".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_factor: 2.0,
            jitter: Duration::from_millis(0),
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = retry_with(&cfg, &cancel, |_| true, || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ProviderError::Timeout)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_wins_over_last_error() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(50),
            backoff_factor: 1.0,
            jitter: Duration::from_millis(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), ProviderError> =
            retry_with(&cfg, &cancel, |_| true, || async { Err(ProviderError::Timeout) }).await;

        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }

    /// A `ChatSession` whose `send_streaming` yields one good chunk then a
    /// retryable error, and whose `send` answers with a fixed text — just
    /// enough to drive the mid-stream fallback path without a real backend.
    struct FlakyMidStreamChat;

    #[async_trait::async_trait]
    impl ChatSession for FlakyMidStreamChat {
        async fn send(&self, _contents: Vec<SendContent>) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                candidates: vec![crate::provider::Candidate {
                    parts: vec![crate::provider::Part::Text("fallback answer".to_string())],
                }],
                usage: crate::provider::TokenUsage::default(),
                finish_reason: crate::provider::FinishReason::Stop,
            })
        }

        async fn send_streaming(
            &self,
            _contents: Vec<SendContent>,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>, ProviderError> {
            let stream = async_stream::stream! {
                yield Ok(StreamChunk::Content("partial ".to_string()));
                yield Err(ProviderError::Timeout);
            };
            Ok(Box::pin(stream))
        }

        fn set_function_definitions(&self, _defs: Vec<FunctionDefinition>) {}

        fn is_retryable_error(&self, err: &ProviderError) -> bool {
            matches!(err, ProviderError::Timeout)
        }

        fn history(&self) -> Vec<crate::provider::Message> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn mid_stream_error_falls_back_preserving_already_yielded_chunks() {
        let chat = RetryingChat {
            inner: Arc::new(FlakyMidStreamChat),
            config: RetryConfig {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                backoff_factor: 1.0,
                jitter: Duration::from_millis(0),
            },
            cancel: CancellationToken::new(),
        };

        let mut stream = chat.send_streaming(vec![SendContent::Text("hi".to_string())]).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamChunk::Content(ref text) if text == "partial "));

        let second = stream.next().await.unwrap().unwrap();
        assert!(matches!(second, StreamChunk::Content(ref text) if text == "fallback answer"));

        let third = stream.next().await.unwrap().unwrap();
        assert!(matches!(third, StreamChunk::Done { .. }));

        assert!(stream.next().await.is_none());
    }
}
