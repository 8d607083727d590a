//! Shared test helpers: a scripted streaming provider and a test context.

use async_trait::async_trait;
use devassist_core::context::{ContextDetail, ConversationContext, LinkIndex, StructuredContext};
use devassist_core::error::{FunctionError, ProviderError};
use devassist_core::fact::Fact;
use devassist_core::function::{DeclaredFunction, FunctionOutcome, FunctionRegistry, ParameterSchema};
use devassist_core::message::MessageToolCall;
use devassist_core::provider::{ChunkReceiver, ModelProvider, ModelRequest, ModelResponse, StreamChunk};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::stream_event::ResponseData;

/// One scripted model reply.
pub struct Script {
    chunks: Vec<Result<StreamChunk, ProviderError>>,
    /// Keep the stream open after the last chunk until the receiver is dropped.
    hang: bool,
}

impl Script {
    /// Text deltas followed by a finish chunk without calls.
    pub fn text(deltas: &[&str]) -> Self {
        let mut chunks: Vec<_> = deltas.iter().map(|d| Ok(StreamChunk::text(*d))).collect();
        chunks.push(Ok(StreamChunk::finish(vec![])));
        Self { chunks, hang: false }
    }

    /// A finish chunk carrying function calls.
    pub fn calls(calls: Vec<MessageToolCall>) -> Self {
        Self {
            chunks: vec![Ok(StreamChunk::finish(calls))],
            hang: false,
        }
    }

    /// Text deltas, then a content block.
    pub fn blocked(deltas: &[&str]) -> Self {
        let mut chunks: Vec<_> = deltas.iter().map(|d| Ok(StreamChunk::text(*d))).collect();
        chunks.push(Err(ProviderError::Blocked("content_filter".into())));
        Self { chunks, hang: false }
    }

    /// Text deltas, then a stream that never finishes.
    pub fn hanging(deltas: &[&str]) -> Self {
        Self {
            chunks: deltas.iter().map(|d| Ok(StreamChunk::text(*d))).collect(),
            hang: true,
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            chunks: vec![Err(error)],
            hang: false,
        }
    }
}

/// A provider that streams scripted replies in order and records requests.
///
/// Panics if more requests are made than scripts provided.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Text of the last message of the n-th request.
    pub fn last_user_text(&self, n: usize) -> String {
        let requests = self.requests.lock().unwrap();
        requests[n]
            .messages
            .iter()
            .rev()
            .find(|m| m.role == devassist_core::message::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        Err(ProviderError::NotConfigured("scripted provider only streams".into()))
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedProvider: no more scripts");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for chunk in script.chunks {
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if script.hang {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}

/// What a [`CountingFunction`] does when called.
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Error(String),
    Fatal,
    /// Cancel the turn from inside the handler.
    CancelTurn,
    Large(usize),
}

/// A declared function that counts its invocations.
pub struct CountingFunction {
    name: &'static str,
    reply: Reply,
    pub calls: Arc<AtomicUsize>,
}

impl CountingFunction {
    pub fn new(name: &'static str, reply: Reply) -> Self {
        Self {
            name,
            reply,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeclaredFunction for CountingFunction {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Looks something up"
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::object().property("key", ParameterSchema::string("Lookup key"), true)
    }

    async fn handle(
        &self,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<FunctionOutcome, FunctionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = args["key"].as_str().unwrap_or_default();
        match &self.reply {
            Reply::Text(text) => Ok(FunctionOutcome::Result(format!("{text} {key}"))),
            Reply::Error(reason) => Ok(FunctionOutcome::Error(reason.clone())),
            Reply::Fatal => Err(FunctionError::ExecutionFailed {
                function_name: self.name.into(),
                reason: "backend gone".into(),
            }),
            Reply::CancelTurn => {
                cancel.cancel();
                Ok(FunctionOutcome::Result("late".into()))
            }
            Reply::Large(size) => Ok(FunctionOutcome::Result("x".repeat(*size))),
        }
    }
}

/// A configurable conversation context.
pub struct TestContext {
    origin: String,
    structured: Option<StructuredContext>,
    links: LinkIndex,
    functions: Vec<Arc<CountingFunction>>,
    pub summary_calls: AtomicUsize,
}

impl TestContext {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.into(),
            structured: None,
            links: LinkIndex::new(),
            functions: Vec::new(),
            summary_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_function(mut self, function: Arc<CountingFunction>) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_structured(mut self, object: StructuredContext) -> Self {
        self.structured = Some(object);
        self
    }

    pub fn with_link(mut self, url: &str, key: &str) -> Self {
        self.links.insert(url.into(), key.into());
        self
    }
}

impl ConversationContext for TestContext {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn title(&self) -> String {
        format!("Context {}", self.origin)
    }

    fn suggestions(&self) -> Vec<String> {
        vec!["What should I fix first?".into()]
    }

    fn preamble(&self) -> Option<String> {
        Some("You are a test assistant.".into())
    }

    fn static_facts(&self) -> Vec<Fact> {
        vec![Fact::required("Static format description", "format")]
    }

    fn summary_facts(&self) -> Vec<Fact> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        vec![Fact::critical(format!("Summary of {}", self.origin), "summary")]
    }

    fn structured_context(&self) -> Option<StructuredContext> {
        self.structured.clone()
    }

    fn details(&self) -> Vec<ContextDetail> {
        vec![ContextDetail {
            title: "Origin".into(),
            text: self.origin.clone(),
        }]
    }

    fn link_index(&self) -> LinkIndex {
        self.links.clone()
    }

    fn declare_functions(&self, registry: &mut FunctionRegistry) -> Result<(), FunctionError> {
        for function in &self.functions {
            registry.declare(function.clone())?;
        }
        Ok(())
    }
}

pub fn make_call(id: &str, name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

/// Drain every event currently buffered in the channel.
pub fn drain(rx: &mut mpsc::Receiver<ResponseData>) -> Vec<ResponseData> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
