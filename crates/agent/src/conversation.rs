//! The conversation run loop.
//!
//! A [`ConversationAgent`] owns one conversation: the chat history shown to
//! the user, the model transcript of completed turns, the function-result
//! cache and the registry of structured objects already described to the
//! model. [`ConversationAgent::run`] drives a single turn:
//!
//! 1. **Rebuild** the function registry and fact store from the context
//! 2. **Announce** the context the first time its origin is used
//! 3. **Query** the model with the (possibly enhanced) user query
//! 4. **If function calls**: service them in order, feed results back, loop
//! 5. **If text only**: parse the answer and commit the whole turn at once
//!
//! Nothing is written to the chat history, the transcript or the history
//! store before the turn ends, so a cancelled turn leaves no trace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use devassist_config::AppConfig;
use devassist_core::context::{ConversationContext, FocusId, StructuredContext};
use devassist_core::error::{FunctionError, HistoryError, ProviderError};
use devassist_core::event::{DomainEvent, EventBus};
use devassist_core::fact::{Fact, FactStore};
use devassist_core::function::{DisplayInfo, FunctionOutcome, FunctionRegistry, canonical_call};
use devassist_core::history::{HistoryItem, HistoryStore, rebuild_chat};
use devassist_core::message::{
    ChatMessage, Conversation, ConversationId, ErrorKind, Message, MessageToolCall, Step,
};
use devassist_core::provider::{ModelProvider, ModelRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CachedResult, FunctionResultCache};
use crate::enhancer::{ShownObjects, enhance_query};
use crate::response::ResponseParser;
use crate::stream_event::ResponseData;

/// Per-turn inputs besides the query.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// The focus the question is about, if any.
    pub context: Option<Arc<dyn ConversationContext>>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: Arc<dyn ConversationContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { answer: String },
    Failed { kind: ErrorKind },
    /// Cancelled; nothing was recorded.
    Aborted,
}

/// What the model sent back for one step.
struct ModelReply {
    text: String,
    calls: Vec<MessageToolCall>,
}

enum CallFailure {
    Cancelled,
    Fatal(FunctionError),
}

/// The conversation agent.
pub struct ConversationAgent {
    provider: Arc<dyn ModelProvider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_steps: u32,
    max_function_result_bytes: usize,
    fact_budget_bytes: Option<usize>,
    event_bus: Arc<EventBus>,
    history: Option<Arc<dyn HistoryStore>>,

    conversation: Conversation,
    /// Model transcript of completed turns.
    transcript: Vec<Message>,
    registry: FunctionRegistry,
    facts: FactStore,
    cache: FunctionResultCache,
    shown: ShownObjects,
    /// Origins whose context event was already emitted.
    announced: HashSet<String>,
    /// Summary facts, computed once per origin.
    summaries: HashMap<String, Vec<Fact>>,
    active_origin: Option<String>,
}

impl ConversationAgent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        model: impl Into<String>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
            max_steps: 10,
            max_function_result_bytes: devassist_config::DEFAULT_MAX_FUNCTION_RESULT_BYTES,
            fact_budget_bytes: None,
            event_bus,
            history: None,
            conversation: Conversation::new(),
            transcript: Vec::new(),
            registry: FunctionRegistry::new(),
            facts: FactStore::new(),
            cache: FunctionResultCache::new(),
            shown: ShownObjects::new(),
            announced: HashSet::new(),
            summaries: HashMap::new(),
            active_origin: None,
        }
    }

    /// Create an agent with model and limits taken from configuration.
    pub fn from_config(
        provider: Arc<dyn ModelProvider>,
        config: &AppConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::new(provider, &config.default_model, event_bus)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_max_steps(config.agent.max_steps)
            .with_max_function_result_bytes(config.agent.max_function_result_bytes)
            .with_fact_budget(config.agent.fact_budget_bytes)
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the maximum number of model requests per turn.
    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = max;
        self
    }

    pub fn with_max_function_result_bytes(mut self, max: usize) -> Self {
        self.max_function_result_bytes = max;
        self
    }

    /// Byte budget for non-required facts. `None` sends every fact.
    pub fn with_fact_budget(mut self, budget: Option<usize>) -> Self {
        self.fact_budget_bytes = budget;
        self
    }

    /// Attach a store that receives every completed turn.
    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation.id
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn cache(&self) -> &FunctionResultCache {
        &self.cache
    }

    /// Start a new chat. The function-result cache is kept.
    pub fn reset(&mut self) {
        info!(conversation_id = %self.conversation.id, "Starting new chat");
        self.conversation.reset();
        self.transcript.clear();
        self.shown.clear();
        self.announced.clear();
        self.facts.clear_facts();
        self.registry.clear();
        self.active_origin = None;
    }

    /// Replace the current conversation with a stored one.
    ///
    /// Returns the number of chat messages restored.
    pub async fn resume(&mut self, id: ConversationId) -> Result<usize, HistoryError> {
        let store = self
            .history
            .clone()
            .ok_or_else(|| HistoryError::Storage("no history store attached".into()))?;
        let items = store.read_all(&id).await?;

        self.reset();
        self.conversation.id = id;
        self.conversation.messages = rebuild_chat(&items);

        // Only answered turns reach the transcript, as in a live session
        for pair in self.conversation.messages.chunks(2) {
            if let [
                ChatMessage::User { text, .. },
                ChatMessage::Model {
                    answer: Some(answer),
                    error: None,
                    ..
                },
            ] = pair
            {
                self.transcript.push(Message::user(text.clone()));
                self.transcript.push(Message::assistant(answer.clone()));
            }
        }

        info!(
            conversation_id = %self.conversation.id,
            messages = self.conversation.messages.len(),
            "Resumed conversation from history"
        );
        Ok(self.conversation.messages.len())
    }

    /// Run one turn, sending response events to `tx`.
    pub async fn run(
        &mut self,
        query: &str,
        options: RunOptions,
        tx: &mpsc::Sender<ResponseData>,
    ) -> TurnOutcome {
        let RunOptions { context, cancel } = options;
        let context = context.as_deref();

        info!(
            conversation_id = %self.conversation.id,
            origin = context.map(|c| c.origin()).unwrap_or("none"),
            "Starting turn"
        );
        self.event_bus.publish(DomainEvent::TurnStarted {
            conversation_id: self.conversation.id.to_string(),
            context_origin: context.map(|c| c.origin().to_string()),
            timestamp: Utc::now(),
        });

        if cancel.is_cancelled() {
            return self.abort(tx).await;
        }

        if let Err(e) = self.prepare_context(context) {
            warn!(error = %e, "Failed to declare context functions");
            self.registry.clear();
            return self
                .fail(query, ErrorKind::Unknown, Vec::new(), e.to_string(), tx)
                .await;
        }

        if let Some(ctx) = context {
            if self.announced.insert(ctx.origin().to_string()) {
                emit(
                    tx,
                    ResponseData::Context {
                        title: ctx.title(),
                        details: ctx.details(),
                    },
                )
                .await;
            }
            if self.conversation.title.is_none() {
                self.conversation.title = Some(ctx.title());
            }
        }

        let structured = context
            .and_then(|c| c.structured_context())
            .filter(|object| self.shown.needs_showing(object));
        let enhanced = enhance_query(query, structured.as_ref());
        let focus = context.map(|c| c.focus_id());
        let preamble = context.and_then(|c| c.preamble());
        let functions = self.registry.declarations();

        let mut turn = vec![Message::user(enhanced)];
        let mut steps: Vec<Step> = Vec::new();

        for step in 1..=self.max_steps {
            if !emit_unless_cancelled(tx, ResponseData::Querying { step }, &cancel).await {
                return self.abort(tx).await;
            }

            let request = ModelRequest {
                model: self.model.clone(),
                preamble: preamble.clone(),
                facts: self.facts.select(self.fact_budget_bytes),
                functions: functions.clone(),
                messages: self.transcript.iter().chain(turn.iter()).cloned().collect(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };
            debug!(
                step,
                facts = request.facts.len(),
                functions = request.functions.len(),
                messages = request.messages.len(),
                "Querying model"
            );

            let reply = match self.query_model(request, &cancel, tx).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return self.abort(tx).await,
                Err(ProviderError::Blocked(reason)) => {
                    warn!(reason = %reason, "Model service blocked the response");
                    return self.fail(query, ErrorKind::Block, steps, reason, tx).await;
                }
                Err(e) => {
                    warn!(error = %e, "Model request failed");
                    return self
                        .fail(query, ErrorKind::Unknown, steps, e.to_string(), tx)
                        .await;
                }
            };

            if reply.calls.is_empty() {
                let links = context.map(|c| c.link_index()).unwrap_or_default();
                let answer = ResponseParser::new(links).parse(&reply.text);
                let suggestions = context.map(|c| c.suggestions()).unwrap_or_default();

                emit(
                    tx,
                    ResponseData::Answer {
                        text: answer.clone(),
                        complete: true,
                        suggestions: suggestions.clone(),
                    },
                )
                .await;

                turn.push(Message::assistant(reply.text));
                let step_count = steps.len();
                self.commit(
                    query,
                    ChatMessage::answer(answer.clone(), steps, suggestions),
                    turn,
                    structured.as_ref(),
                )
                .await;

                self.event_bus.publish(DomainEvent::TurnCompleted {
                    conversation_id: self.conversation.id.to_string(),
                    steps: step_count,
                    timestamp: Utc::now(),
                });
                info!(
                    conversation_id = %self.conversation.id,
                    steps = step_count,
                    answer_len = answer.len(),
                    "Turn completed"
                );
                return TurnOutcome::Completed { answer };
            }

            debug!(count = reply.calls.len(), "Servicing function calls");
            let mut assistant = Message::function_calls(reply.calls.clone());
            assistant.content = reply.text;
            turn.push(assistant);

            for call in &reply.calls {
                let (display, outcome) =
                    match self.call_function(focus.as_ref(), call, &cancel).await {
                        Ok(result) => result,
                        Err(CallFailure::Cancelled) => return self.abort(tx).await,
                        Err(CallFailure::Fatal(e)) => {
                            warn!(function = %call.name, error = %e, "Function failed");
                            return self
                                .fail(query, ErrorKind::Unknown, steps, e.to_string(), tx)
                                .await;
                        }
                    };

                let output = outcome.to_model_text();
                let action = ResponseData::Action {
                    name: call.name.clone(),
                    title: display.title.clone(),
                    action: display.action.clone(),
                    output: Some(output.clone()),
                    canceled: false,
                };
                if !emit_unless_cancelled(tx, action, &cancel).await {
                    return self.abort(tx).await;
                }
                steps.push(Step {
                    title: display.title,
                    action: display.action,
                    output: Some(output.clone()),
                    canceled: false,
                });
                turn.push(Message::tool_result(call.id.clone(), output));
            }
        }

        warn!(max_steps = self.max_steps, "Step limit reached without a final answer");
        self.fail(
            query,
            ErrorKind::MaxSteps,
            steps,
            format!("no answer after {} steps", self.max_steps),
            tx,
        )
        .await
    }

    /// Rebuild functions and facts from the selected context.
    fn prepare_context(&mut self, context: Option<&dyn ConversationContext>) -> Result<(), FunctionError> {
        let origin = context.map(|c| c.origin().to_string());
        if origin != self.active_origin {
            debug!(from = ?self.active_origin, to = ?origin, "Active context changed");
            self.active_origin = origin;
        }

        self.registry.clear();
        self.facts.clear_facts();

        let Some(ctx) = context else {
            return Ok(());
        };

        ctx.declare_functions(&mut self.registry)?;

        self.facts.extend(ctx.static_facts());
        let summary = self
            .summaries
            .entry(ctx.origin().to_string())
            .or_insert_with(|| ctx.summary_facts());
        self.facts.extend(summary.iter().cloned());
        self.facts.extend(self.cache.facts_for(&ctx.focus_id()));

        debug!(
            functions = self.registry.len(),
            facts = self.facts.len(),
            "Context prepared"
        );
        Ok(())
    }

    /// Stream one model reply. `Ok(None)` means the turn was cancelled.
    async fn query_model(
        &self,
        request: ModelRequest,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<ResponseData>,
    ) -> Result<Option<ModelReply>, ProviderError> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            opened = self.provider.stream(request) => opened?,
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = rx.recv() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ProviderError::StreamInterrupted(
                        "stream closed before the finish signal".into(),
                    ));
                }
            };

            if let Some(delta) = chunk.content.as_deref().filter(|d| !d.is_empty()) {
                text.push_str(delta);
                let partial = ResponseData::Answer {
                    text: text.clone(),
                    complete: false,
                    suggestions: Vec::new(),
                };
                if !emit_unless_cancelled(tx, partial, cancel).await {
                    return Ok(None);
                }
            }

            if chunk.done {
                if let Some(usage) = &chunk.usage {
                    self.event_bus.publish(DomainEvent::ResponseGenerated {
                        conversation_id: self.conversation.id.to_string(),
                        model: self.model.clone(),
                        tokens_used: usage.total_tokens,
                        timestamp: Utc::now(),
                    });
                }
                return Ok(Some(ModelReply {
                    text,
                    calls: chunk.tool_calls,
                }));
            }
        }
    }

    /// Serve one function call from the cache or its handler.
    async fn call_function(
        &mut self,
        focus: Option<&FocusId>,
        call: &MessageToolCall,
        cancel: &CancellationToken,
    ) -> Result<(DisplayInfo, FunctionOutcome), CallFailure> {
        let fallback_title = format!("Calling {}", call.name);

        let args: serde_json::Value = if call.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(&call.arguments) {
                Ok(args) => args,
                Err(e) => {
                    warn!(function = %call.name, error = %e, "Unparseable function arguments");
                    let display = DisplayInfo {
                        title: fallback_title,
                        action: format!("{}({})", call.name, call.arguments),
                    };
                    return Ok((display, FunctionOutcome::Error(format!("Invalid arguments: {e}"))));
                }
            }
        };
        let key = canonical_call(&call.name, &args);

        let Some(function) = self.registry.get(&call.name) else {
            warn!(function = %call.name, "Model called an undeclared function");
            let display = DisplayInfo {
                title: fallback_title,
                action: key,
            };
            return Ok((
                display,
                FunctionOutcome::Error(format!("Function {} does not exist", call.name)),
            ));
        };
        let display = function.display_info(&args);

        if let Some(cached) = focus.and_then(|f| self.cache.get(f, &key)) {
            debug!(call = %key, "Serving function result from cache");
            self.event_bus.publish(DomainEvent::FunctionExecuted {
                function_name: call.name.clone(),
                cached: true,
                success: !cached.is_error,
                duration_ms: 0,
                timestamp: Utc::now(),
            });
            return Ok((display, cached.to_outcome()));
        }

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CallFailure::Cancelled),
            result = function.handle(args, cancel) => result,
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            return Err(CallFailure::Cancelled);
        }

        let outcome = match result {
            Ok(outcome) => self.limit_size(outcome),
            Err(FunctionError::Cancelled(_)) => return Err(CallFailure::Cancelled),
            Err(e) => {
                self.event_bus.publish(DomainEvent::FunctionExecuted {
                    function_name: call.name.clone(),
                    cached: false,
                    success: false,
                    duration_ms,
                    timestamp: Utc::now(),
                });
                return Err(CallFailure::Fatal(e));
            }
        };

        self.event_bus.publish(DomainEvent::FunctionExecuted {
            function_name: call.name.clone(),
            cached: false,
            success: !outcome.is_error(),
            duration_ms,
            timestamp: Utc::now(),
        });
        debug!(call = %key, duration_ms, error = outcome.is_error(), "Function executed");

        if let Some(focus) = focus {
            self.cache.set(focus, key.clone(), CachedResult::from(&outcome));
            if !outcome.is_error() {
                self.facts
                    .add_fact(FunctionResultCache::fact(&key, outcome.text()));
            }
        }

        Ok((display, outcome))
    }

    /// Replace oversized results with an error asking for a narrower scope.
    fn limit_size(&self, outcome: FunctionOutcome) -> FunctionOutcome {
        match outcome {
            FunctionOutcome::Result(text) if text.len() > self.max_function_result_bytes => {
                warn!(
                    bytes = text.len(),
                    limit = self.max_function_result_bytes,
                    "Function result too large"
                );
                FunctionOutcome::Error(format!(
                    "The result is too large ({} bytes, limit {}). Narrow the scope of the request, for example by using narrower bounds.",
                    text.len(),
                    self.max_function_result_bytes
                ))
            }
            other => other,
        }
    }

    /// Append a finished turn everywhere at once.
    async fn commit(
        &mut self,
        query: &str,
        model: ChatMessage,
        turn: Vec<Message>,
        shown: Option<&StructuredContext>,
    ) {
        let user = ChatMessage::user(query);
        self.persist(&user, &model).await;
        self.conversation.push_turn(user, model);
        self.transcript.extend(turn);
        if let Some(object) = shown {
            self.shown.mark_shown(object);
        }
    }

    /// End the turn with a terminal error. The chat history records it; the
    /// transcript does not.
    async fn fail(
        &mut self,
        query: &str,
        kind: ErrorKind,
        steps: Vec<Step>,
        message: String,
        tx: &mpsc::Sender<ResponseData>,
    ) -> TurnOutcome {
        emit(tx, ResponseData::Error { kind }).await;

        let user = ChatMessage::user(query);
        let model = ChatMessage::failure(kind, steps);
        self.persist(&user, &model).await;
        self.conversation.push_turn(user, model);

        self.event_bus.publish(DomainEvent::TurnFailed {
            conversation_id: self.conversation.id.to_string(),
            kind,
            message,
            timestamp: Utc::now(),
        });
        TurnOutcome::Failed { kind }
    }

    async fn abort(&mut self, tx: &mpsc::Sender<ResponseData>) -> TurnOutcome {
        info!(conversation_id = %self.conversation.id, "Turn cancelled");
        emit(tx, ResponseData::Error { kind: ErrorKind::Abort }).await;
        self.event_bus.publish(DomainEvent::TurnFailed {
            conversation_id: self.conversation.id.to_string(),
            kind: ErrorKind::Abort,
            message: "cancelled".into(),
            timestamp: Utc::now(),
        });
        TurnOutcome::Aborted
    }

    async fn persist(&self, user: &ChatMessage, model: &ChatMessage) {
        let Some(store) = &self.history else {
            return;
        };
        for message in [user, model] {
            if let Err(e) = store
                .add_history_item(&self.conversation.id, HistoryItem::from_chat(message))
                .await
            {
                warn!(store = store.name(), error = %e, "Failed to persist history item");
            }
        }
    }
}

async fn emit(tx: &mpsc::Sender<ResponseData>, event: ResponseData) {
    if tx.send(event).await.is_err() {
        debug!("Response receiver dropped");
    }
}

/// Like [`emit`], but gives up waiting on a full channel once the turn is
/// cancelled. Returns `false` when cancelled.
async fn emit_unless_cancelled(
    tx: &mpsc::Sender<ResponseData>,
    event: ResponseData,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = emit(tx, event) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use devassist_core::context::ShowPolicy;
    use devassist_core::fact::FactPriority;
    use devassist_history::InMemoryHistory;

    struct Harness {
        agent: ConversationAgent,
        provider: Arc<ScriptedProvider>,
        history: Arc<InMemoryHistory>,
    }

    fn harness(scripts: Vec<Script>) -> Harness {
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let history = Arc::new(InMemoryHistory::new());
        let agent = ConversationAgent::new(provider.clone(), "mock-model", Arc::new(EventBus::default()))
            .with_history(history.clone());
        Harness {
            agent,
            provider,
            history,
        }
    }

    async fn turn(
        agent: &mut ConversationAgent,
        query: &str,
        context: Option<Arc<dyn ConversationContext>>,
    ) -> (TurnOutcome, Vec<ResponseData>) {
        let (tx, mut rx) = mpsc::channel(256);
        let options = RunOptions {
            context,
            cancel: CancellationToken::new(),
        };
        let outcome = agent.run(query, options, &tx).await;
        (outcome, drain(&mut rx))
    }

    async fn stored(h: &Harness) -> Vec<ChatMessage> {
        let items = h.history.read_all(h.agent.conversation_id()).await.unwrap();
        rebuild_chat(&items)
    }

    fn actions(events: &[ResponseData]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ResponseData::Action { .. }))
            .count()
    }

    fn call_tree(id: &str) -> StructuredContext {
        StructuredContext {
            id: id.into(),
            kind: "call_tree".into(),
            description: format!("# Selected call tree {id}"),
            policy: ShowPolicy::Once,
        }
    }

    #[tokio::test]
    async fn plain_answer_is_recorded_without_actions() {
        let mut h = harness(vec![Script::text(&["test"])]);

        let (outcome, events) = turn(&mut h.agent, "test", None).await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                answer: "test".into()
            }
        );
        assert_eq!(actions(&events), 0);
        assert!(events.last().unwrap().is_final_answer());
        assert_eq!(
            stored(&h).await,
            vec![ChatMessage::user("test"), ChatMessage::answer("test", vec![], vec![])]
        );
        assert_eq!(h.agent.conversation().messages.len(), 2);
    }

    #[tokio::test]
    async fn only_the_final_answer_is_persisted() {
        let mut h = harness(vec![Script::text(&[
            "partially started",
            " and now it's finished",
        ])]);

        let (_, events) = turn(&mut h.agent, "q", None).await;

        let partials: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ResponseData::Answer {
                    text,
                    complete: false,
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            partials,
            vec!["partially started", "partially started and now it's finished"]
        );

        let history = stored(&h).await;
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1],
            ChatMessage::answer("partially started and now it's finished", vec![], vec![])
        );
    }

    #[tokio::test]
    async fn blocked_answer_records_error_without_text() {
        let mut h = harness(vec![Script::blocked(&["some partial"])]);

        let (outcome, events) = turn(&mut h.agent, "q", None).await;

        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                kind: ErrorKind::Block
            }
        );
        assert_eq!(
            events.last(),
            Some(&ResponseData::Error {
                kind: ErrorKind::Block
            })
        );
        let history = stored(&h).await;
        assert_eq!(history[0], ChatMessage::user("q"));
        assert_eq!(history[1], ChatMessage::failure(ErrorKind::Block, vec![]));
        assert!(h.agent.transcript().is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_writes_nothing() {
        let mut h = harness(vec![Script::hanging(&["partial"])]);
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        let consumer = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                if matches!(event, ResponseData::Answer { .. }) {
                    canceller.cancel();
                }
                events.push(event);
            }
            events
        });

        let outcome = h
            .agent
            .run("q", RunOptions::new().with_cancel(cancel), &tx)
            .await;
        drop(tx);
        let events = consumer.await.unwrap();

        assert_eq!(outcome, TurnOutcome::Aborted);
        assert_eq!(
            events.last(),
            Some(&ResponseData::Error {
                kind: ErrorKind::Abort
            })
        );
        assert!(!events.iter().any(ResponseData::is_final_answer));
        assert!(stored(&h).await.is_empty());
        assert!(h.agent.conversation().is_empty());
        assert!(h.agent.transcript().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_not_held_up_by_a_full_channel() {
        let mut h = harness(vec![Script::hanging(&["a", "b", "c"])]);
        // Room for the Querying event only; nobody reads until after the cancel
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        let consumer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            canceller.cancel();
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        let outcome = h
            .agent
            .run("q", RunOptions::new().with_cancel(cancel), &tx)
            .await;
        drop(tx);
        let events = consumer.await.unwrap();

        assert_eq!(outcome, TurnOutcome::Aborted);
        assert!(matches!(events[0], ResponseData::Querying { step: 1 }));
        assert!(!events.iter().any(|e| matches!(e, ResponseData::Answer { .. })));
        assert_eq!(
            events.last(),
            Some(&ResponseData::Error {
                kind: ErrorKind::Abort
            })
        );
        assert!(stored(&h).await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_inside_a_handler_emits_no_action() {
        let lookup = Arc::new(CountingFunction::new("lookup", Reply::CancelTurn));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(lookup.clone()));
        let mut h = harness(vec![Script::calls(vec![make_call(
            "c1",
            "lookup",
            serde_json::json!({"key": "k"}),
        )])]);

        let (outcome, events) = turn(&mut h.agent, "q", Some(ctx)).await;

        assert_eq!(outcome, TurnOutcome::Aborted);
        assert_eq!(lookup.count(), 1);
        assert_eq!(actions(&events), 0);
        assert!(stored(&h).await.is_empty());
        assert!(h.agent.cache().is_empty());
    }

    #[tokio::test]
    async fn pre_cancelled_turn_never_queries() {
        let mut h = harness(vec![]);
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h
            .agent
            .run("q", RunOptions::new().with_cancel(cancel), &tx)
            .await;

        assert_eq!(outcome, TurnOutcome::Aborted);
        assert!(h.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn identical_calls_are_served_from_cache_per_focus() {
        let lookup = Arc::new(CountingFunction::new("lookup", Reply::Text("result".into())));
        let a: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(lookup.clone()));
        let b: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:b").with_function(lookup.clone()));
        let call = || make_call("c1", "lookup", serde_json::json!({"key": "x"}));
        let mut h = harness(vec![
            Script::calls(vec![call()]),
            Script::text(&["one"]),
            Script::calls(vec![call()]),
            Script::text(&["two"]),
            Script::calls(vec![call()]),
            Script::text(&["three"]),
        ]);

        turn(&mut h.agent, "first", Some(a.clone())).await;
        let (_, events) = turn(&mut h.agent, "second", Some(a)).await;
        assert_eq!(lookup.count(), 1);
        assert_eq!(actions(&events), 1);

        // the cached result is re-injected as a fact on the next turn
        let requests = h.provider.requests();
        let facts: Vec<&str> = requests[2].facts.iter().map(|f| f.text.as_str()).collect();
        assert!(facts.contains(&"This is the result of calling lookup({\"key\":\"x\"}):\nresult x"));

        turn(&mut h.agent, "third", Some(b)).await;
        assert_eq!(lookup.count(), 2);
    }

    #[tokio::test]
    async fn oversized_results_ask_for_narrower_scope() {
        let big = Arc::new(CountingFunction::new("big", Reply::Large(70_000)));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(big.clone()));
        let mut h = harness(vec![
            Script::calls(vec![make_call("c1", "big", serde_json::json!({"key": "all"}))]),
            Script::text(&["narrowed"]),
        ]);

        let (outcome, events) = turn(&mut h.agent, "q", Some(ctx)).await;

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let output = events
            .iter()
            .find_map(|e| match e {
                ResponseData::Action { output, .. } => output.clone(),
                _ => None,
            })
            .unwrap();
        assert!(output.starts_with("Error: The result is too large"));
        assert!(output.contains("narrower bounds"));

        let second = &h.provider.requests()[1];
        let tool = second.messages.last().unwrap();
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
        assert!(tool.content.len() < 1000);
        assert!(!second.facts.iter().any(|f| f.text.contains("xxxx")));
    }

    #[tokio::test]
    async fn unknown_function_is_recoverable() {
        let mut h = harness(vec![
            Script::calls(vec![make_call("c1", "nope", serde_json::json!({}))]),
            Script::text(&["sorry"]),
        ]);

        let (outcome, _) = turn(&mut h.agent, "q", None).await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                answer: "sorry".into()
            }
        );
        match &h.agent.conversation().messages[1] {
            ChatMessage::Model { steps, .. } => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].output.as_deref(), Some("Error: Function nope does not exist"));
                assert_eq!(steps[0].action, "nope({})");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn recoverable_handler_errors_feed_back_to_the_model() {
        let lookup = Arc::new(CountingFunction::new("lookup", Reply::Error("No event with key e-99".into())));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(lookup));
        let mut h = harness(vec![
            Script::calls(vec![make_call("c1", "lookup", serde_json::json!({"key": "e-99"}))]),
            Script::text(&["That event does not exist."]),
        ]);

        let (outcome, _) = turn(&mut h.agent, "q", Some(ctx)).await;

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let second = &h.provider.requests()[1];
        assert_eq!(second.messages.last().unwrap().content, "Error: No event with key e-99");
    }

    #[tokio::test]
    async fn fatal_handler_error_fails_turn_but_keeps_agent_usable() {
        let broken = Arc::new(CountingFunction::new("broken", Reply::Fatal));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(broken));
        let mut h = harness(vec![
            Script::calls(vec![make_call("c1", "broken", serde_json::json!({"key": "k"}))]),
            Script::text(&["recovered"]),
        ]);

        let (outcome, _) = turn(&mut h.agent, "q", Some(ctx.clone())).await;
        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                kind: ErrorKind::Unknown
            }
        );

        let (outcome, _) = turn(&mut h.agent, "again", Some(ctx)).await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(stored(&h).await.len(), 4);
        // the failed turn never reached the transcript
        assert_eq!(h.agent.transcript().len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_unknown() {
        let mut h = harness(vec![Script::failing(ProviderError::Network("connection reset".into()))]);

        let (outcome, events) = turn(&mut h.agent, "q", None).await;

        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                kind: ErrorKind::Unknown
            }
        );
        assert_eq!(
            events.last(),
            Some(&ResponseData::Error {
                kind: ErrorKind::Unknown
            })
        );
    }

    #[tokio::test]
    async fn step_limit_ends_turn() {
        let lookup = Arc::new(CountingFunction::new("lookup", Reply::Text("r".into())));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(lookup));
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::calls(vec![make_call("c1", "lookup", serde_json::json!({"key": "1"}))]),
            Script::calls(vec![make_call("c2", "lookup", serde_json::json!({"key": "2"}))]),
        ]));
        let mut agent = ConversationAgent::new(provider, "mock-model", Arc::new(EventBus::default()))
            .with_max_steps(2);

        let (outcome, events) = turn(&mut agent, "q", Some(ctx)).await;

        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                kind: ErrorKind::MaxSteps
            }
        );
        assert_eq!(actions(&events), 2);
        match &agent.conversation().messages[1] {
            ChatMessage::Model { error, steps, answer, .. } => {
                assert_eq!(*error, Some(ErrorKind::MaxSteps));
                assert_eq!(steps.len(), 2);
                assert!(answer.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_event_is_emitted_once_per_origin() {
        let a: Arc<dyn ConversationContext> = Arc::new(TestContext::new("trace:a"));
        let b: Arc<dyn ConversationContext> = Arc::new(TestContext::new("trace:b"));
        let mut h = harness(vec![
            Script::text(&["1"]),
            Script::text(&["2"]),
            Script::text(&["3"]),
        ]);

        let count = |events: &[ResponseData]| {
            events
                .iter()
                .filter(|e| matches!(e, ResponseData::Context { .. }))
                .count()
        };

        let (_, first) = turn(&mut h.agent, "q1", Some(a.clone())).await;
        let (_, second) = turn(&mut h.agent, "q2", Some(a)).await;
        let (_, third) = turn(&mut h.agent, "q3", Some(b)).await;

        assert_eq!(count(&first), 1);
        assert!(matches!(&first[0], ResponseData::Context { title, .. } if title == "Context trace:a"));
        assert_eq!(count(&second), 0);
        assert_eq!(count(&third), 1);
    }

    #[tokio::test]
    async fn call_tree_is_not_resent_for_the_same_object() {
        let a: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:1/call-tree:e-5").with_structured(call_tree("e-5")));
        let other: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:1/call-tree:e-9").with_structured(call_tree("e-9")));
        let mut h = harness(vec![
            Script::text(&["1"]),
            Script::text(&["2"]),
            Script::text(&["3"]),
        ]);

        turn(&mut h.agent, "Why slow?", Some(a.clone())).await;
        turn(&mut h.agent, "And this one?", Some(other)).await;
        turn(&mut h.agent, "Back again", Some(a)).await;

        assert_eq!(
            h.provider.last_user_text(0),
            "# Selected call tree e-5\n\n# User request\n\nWhy slow?"
        );
        assert!(h.provider.last_user_text(1).starts_with("# Selected call tree e-9"));
        assert_eq!(h.provider.last_user_text(2), "Back again");
        // chat history keeps the raw query
        assert_eq!(h.agent.conversation().messages[0], ChatMessage::user("Why slow?"));
    }

    #[tokio::test]
    async fn changed_insight_is_resent() {
        let insight = |id: &str| StructuredContext {
            id: id.into(),
            kind: "insight".into(),
            description: format!("# Insight {id}"),
            policy: ShowPolicy::WhenChanged,
        };
        let lcp: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:1/insight:LCP").with_structured(insight("LCP")));
        let cls: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:1/insight:CLS").with_structured(insight("CLS")));
        let mut h = harness(vec![
            Script::text(&["1"]),
            Script::text(&["2"]),
            Script::text(&["3"]),
            Script::text(&["4"]),
        ]);

        turn(&mut h.agent, "q1", Some(lcp.clone())).await;
        turn(&mut h.agent, "q2", Some(lcp.clone())).await;
        turn(&mut h.agent, "q3", Some(cls)).await;
        turn(&mut h.agent, "q4", Some(lcp)).await;

        assert!(h.provider.last_user_text(0).starts_with("# Insight LCP"));
        assert_eq!(h.provider.last_user_text(1), "q2");
        assert!(h.provider.last_user_text(2).starts_with("# Insight CLS"));
        assert!(h.provider.last_user_text(3).starts_with("# Insight LCP"));
    }

    #[tokio::test]
    async fn switching_context_removes_previous_functions() {
        let alpha = Arc::new(CountingFunction::new("alpha", Reply::Text("a".into())));
        let beta = Arc::new(CountingFunction::new("beta", Reply::Text("b".into())));
        let a: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(alpha.clone()));
        let b: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:b").with_function(beta));
        let mut h = harness(vec![
            Script::text(&["hi"]),
            Script::calls(vec![make_call("c1", "alpha", serde_json::json!({"key": "k"}))]),
            Script::text(&["done"]),
        ]);

        turn(&mut h.agent, "q1", Some(a)).await;
        let (_, events) = turn(&mut h.agent, "q2", Some(b)).await;

        assert_eq!(alpha.count(), 0);
        let names: Vec<String> = h.provider.requests()[1]
            .functions
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(names, vec!["beta"]);
        assert!(events.iter().any(|e| matches!(
            e,
            ResponseData::Action { output: Some(o), .. } if o == "Error: Function alpha does not exist"
        )));
    }

    #[tokio::test]
    async fn facts_are_rebuilt_in_order_and_summaries_memoized() {
        let ctx = Arc::new(TestContext::new("trace:a"));
        let dyn_ctx: Arc<dyn ConversationContext> = ctx.clone();
        let mut h = harness(vec![Script::text(&["1"]), Script::text(&["2"])]);

        turn(&mut h.agent, "q1", Some(dyn_ctx.clone())).await;
        turn(&mut h.agent, "q2", Some(dyn_ctx)).await;

        assert_eq!(ctx.summary_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let facts = &h.provider.requests()[1].facts;
        assert_eq!(facts[0].priority, FactPriority::Required);
        assert_eq!(facts[1].text, "Summary of trace:a");
        assert_eq!(h.provider.requests()[1].preamble.as_deref(), Some("You are a test assistant."));

        // no context: nothing carried over
        let mut h2 = harness(vec![Script::text(&["1"]), Script::text(&["2"])]);
        turn(&mut h2.agent, "q1", Some(Arc::new(TestContext::new("trace:a")))).await;
        turn(&mut h2.agent, "q2", None).await;
        assert!(h2.provider.requests()[1].facts.is_empty());
        assert!(h2.provider.requests()[1].preamble.is_none());
    }

    #[tokio::test]
    async fn final_answer_links_and_suggestions() {
        let ctx: Arc<dyn ConversationContext> = Arc::new(
            TestContext::new("trace:a").with_link("https://example.com/app.js", "r-3"),
        );
        let mut h = harness(vec![Script::text(&["`````\nhttps://example.com/app.js is slow\n`````"])]);

        let (outcome, events) = turn(&mut h.agent, "q", Some(ctx)).await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                answer: "[https://example.com/app.js](#r-3) is slow".into()
            }
        );
        match events.last().unwrap() {
            ResponseData::Answer {
                complete: true,
                suggestions,
                ..
            } => assert_eq!(suggestions, &vec!["What should I fix first?".to_string()]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn transcript_holds_completed_exchanges() {
        let lookup = Arc::new(CountingFunction::new("lookup", Reply::Text("found".into())));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(lookup));
        let mut h = harness(vec![
            Script::calls(vec![make_call("c1", "lookup", serde_json::json!({"key": "k"}))]),
            Script::text(&["answer"]),
            Script::text(&["follow-up answer"]),
        ]);

        turn(&mut h.agent, "q1", Some(ctx.clone())).await;
        assert_eq!(h.agent.transcript().len(), 4);
        assert_eq!(h.agent.transcript()[1].tool_calls.len(), 1);
        assert_eq!(h.agent.transcript()[2].content, "found k");

        turn(&mut h.agent, "q2", Some(ctx)).await;
        // the follow-up request carries the previous exchange
        assert_eq!(h.provider.requests()[2].messages.len(), 5);
    }

    #[tokio::test]
    async fn reset_keeps_cache_but_forgets_conversation() {
        let lookup = Arc::new(CountingFunction::new("lookup", Reply::Text("r".into())));
        let ctx: Arc<dyn ConversationContext> =
            Arc::new(TestContext::new("trace:a").with_function(lookup.clone()));
        let mut h = harness(vec![
            Script::calls(vec![make_call("c1", "lookup", serde_json::json!({"key": "k"}))]),
            Script::text(&["1"]),
            Script::calls(vec![make_call("c2", "lookup", serde_json::json!({"key": "k"}))]),
            Script::text(&["2"]),
        ]);

        turn(&mut h.agent, "q1", Some(ctx.clone())).await;
        let old_id = h.agent.conversation_id().clone();
        h.agent.reset();

        assert!(h.agent.conversation().is_empty());
        assert!(h.agent.transcript().is_empty());
        assert_ne!(h.agent.conversation_id(), &old_id);
        assert_eq!(h.agent.cache().len(), 1);

        let (_, events) = turn(&mut h.agent, "q2", Some(ctx)).await;
        assert!(matches!(events[0], ResponseData::Context { .. }));
        assert_eq!(lookup.count(), 1);
    }

    #[tokio::test]
    async fn resume_rebuilds_chat_and_transcript() {
        let mut h = harness(vec![Script::text(&["first answer"]), Script::blocked(&[])]);
        turn(&mut h.agent, "q1", None).await;
        turn(&mut h.agent, "q2", None).await;
        let id = h.agent.conversation_id().clone();

        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let mut fresh = ConversationAgent::new(provider, "mock-model", Arc::new(EventBus::default()))
            .with_history(h.history.clone());
        let restored = fresh.resume(id.clone()).await.unwrap();

        assert_eq!(restored, 4);
        assert_eq!(fresh.conversation_id(), &id);
        assert_eq!(fresh.transcript().len(), 2);
        assert_eq!(fresh.transcript()[1].content, "first answer");
    }

    #[tokio::test]
    async fn resume_without_store_fails() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let mut agent = ConversationAgent::new(provider, "mock-model", Arc::new(EventBus::default()));
        assert!(agent.resume(ConversationId::from("x")).await.is_err());
    }

    #[test]
    fn from_config_applies_limits() {
        let mut config = AppConfig::default();
        config.agent.max_steps = 3;
        config.agent.fact_budget_bytes = Some(100);
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let agent = ConversationAgent::from_config(provider, &config, Arc::new(EventBus::default()));
        assert_eq!(agent.max_steps, 3);
        assert_eq!(agent.fact_budget_bytes, Some(100));
        assert_eq!(agent.model, config.default_model);
    }
}
