use crate::conversation::Message;
use crate::error::{Result, VoxError};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Streamed text tokens from one model call.
///
/// An `Err` item ends the stream; whatever came before it stands.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Streaming chat model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Open a token stream answering `history`.
    async fn stream(&self, history: Vec<Message>) -> Result<TokenStream>;

    fn name(&self) -> &str;
}

#[async_trait]
impl<T: LanguageModel + ?Sized> LanguageModel for Arc<T> {
    async fn stream(&self, history: Vec<Message>) -> Result<TokenStream> {
        (**self).stream(history).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Model that replays a fixed list of tokens.
///
/// A gate can hold the stream after a given number of tokens until the test
/// releases it, which makes "interrupt mid-stream" deterministic.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    tokens: Vec<String>,
    token_delay: Duration,
    fail_after: Option<usize>,
    gate: Option<(usize, Arc<Notify>)>,
    fail_open: bool,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(tokens: impl IntoIterator<Item = S>) -> Self {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            token_delay: Duration::ZERO,
            fail_after: None,
            gate: None,
            fail_open: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Split `text` into word tokens that keep their trailing whitespace.
    pub fn from_text(text: &str) -> Self {
        let mut tokens = Vec::new();
        let mut current = String::new();
        for c in text.chars() {
            current.push(c);
            if c.is_whitespace() {
                tokens.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        Self::new(tokens)
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Yield an error after `count` tokens.
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Fail the call itself, before any token.
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Wait on `gate` after yielding `count` tokens.
    pub fn with_gate(mut self, count: usize, gate: Arc<Notify>) -> Self {
        self.gate = Some((count, gate));
        self
    }

    /// Histories this model was called with.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream(&self, history: Vec<Message>) -> Result<TokenStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(history);
        }
        if self.fail_open {
            return Err(VoxError::backend("model", "scripted model refused the call"));
        }

        let tokens = self.tokens.clone();
        let delay = self.token_delay;
        let fail_after = self.fail_after;
        let gate = self.gate.clone();

        let stream = stream::unfold(0usize, move |index| {
            let tokens = tokens.clone();
            let gate = gate.clone();
            async move {
                if let Some((at, notify)) = &gate
                    && *at == index
                {
                    notify.notified().await;
                }
                if fail_after == Some(index) {
                    return Some((Err(VoxError::backend("model", "stream dropped")), usize::MAX));
                }
                let token = tokens.get(index)?.clone();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(token), index + 1))
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
