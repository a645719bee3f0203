//! The streaming response pipeline.
//!
//! One generation = context assembly → streaming LLM loop (with tool
//! round-trips fed back into the context) → sentence segmentation →
//! per-sentence TTS with bounded parallelism → ordered event emission.
//!
//! The generator is a push source into a bounded channel; the actor is the
//! sole consumer. When the actor lags, `send` suspends the whole pipeline
//! (the LLM byte stream simply isn't polled). A single cancellation token
//! reaches every suspension point; once it fires, sub-tasks are drained and
//! exactly one terminal event is emitted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parlance_audio::AudioFormat;
use parlance_backends::retry::{self, LLM_ATTEMPTS, TOOL_ATTEMPTS, TTS_ATTEMPTS};
use parlance_backends::{BackendError, Backends, ChatRequest, LlmEvent};
use parlance_core::config::{
    LlmConfig, LLM_TIMEOUT_SECS, TOOL_TIMEOUT_SECS, TTS_TIMEOUT_SECS,
};
use parlance_store::ConversationStore;

use crate::context::{assemble_history, compose_system, retrieve_memories};
use crate::event::{GeneratorEvent, SentenceAudio};
use crate::segment::SentenceSegmenter;

/// Sentences queued for TTS ahead of delivery.
const TTS_PARALLELISM: usize = 2;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub history_limit: usize,
    pub memory_k: usize,
    pub llm_deadline: Duration,
    pub tool_deadline: Duration,
    pub tts_deadline: Duration,
    pub max_tool_rounds: u32,
}

impl GeneratorSettings {
    pub fn new(llm: &LlmConfig) -> Self {
        Self {
            model: llm.model.clone(),
            system_prompt: String::new(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            history_limit: 20,
            memory_k: 4,
            llm_deadline: Duration::from_secs(LLM_TIMEOUT_SECS),
            tool_deadline: Duration::from_secs(TOOL_TIMEOUT_SECS),
            tts_deadline: Duration::from_secs(TTS_TIMEOUT_SECS),
            max_tool_rounds: 8,
        }
    }
}

/// Handle to one running generation. Exactly one of these is live per
/// conversation at a time.
pub struct GenerationHandle {
    pub events: mpsc::Receiver<GeneratorEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl GenerationHandle {
    /// Request cooperative cancellation. Idempotent; the terminal
    /// `Cancelled` event arrives on the event channel once sub-tasks have
    /// drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Factory bound to a backend stack, a store, and settings.
pub struct ResponseGenerator {
    backends: Backends,
    store: Arc<ConversationStore>,
    settings: GeneratorSettings,
}

impl ResponseGenerator {
    pub fn new(
        backends: Backends,
        store: Arc<ConversationStore>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            backends,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Start generating a reply to `user_text` in `conversation_id`.
    ///
    /// The returned handle's channel yields events until exactly one
    /// terminal (`Completed` / `Cancelled` / `Failed`). Panics inside the
    /// pipeline are caught at the task boundary and become
    /// `Failed("internal")`.
    pub fn spawn(&self, conversation_id: &str, user_text: &str) -> GenerationHandle {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let mut run = GenerationRun {
            backends: self.backends.clone(),
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            conversation_id: conversation_id.to_string(),
            user_text: user_text.to_string(),
            cancel: cancel.clone(),
            tx: tx.clone(),
            segmenter: SentenceSegmenter::new(),
            tts_queue: VecDeque::new(),
            next_sentence_index: 0,
            reasoning_index: 0,
            reasoning_buf: String::new(),
            full_text: String::new(),
        };

        let task = tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(run.drive())
                .catch_unwind()
                .await;
            run.shutdown().await;

            let terminal = match outcome {
                Ok(Ok(full_text)) => GeneratorEvent::Completed { full_text },
                Ok(Err(End::Cancelled)) => GeneratorEvent::Cancelled,
                Ok(Err(End::Failed(reason))) => GeneratorEvent::Failed { reason },
                Err(_) => GeneratorEvent::Failed {
                    reason: "internal".to_string(),
                },
            };
            let _ = tx.send(terminal).await;
        });

        GenerationHandle {
            events: rx,
            cancel,
            task,
        }
    }
}

/// Why a run ended short of completion.
enum End {
    Cancelled,
    Failed(String),
}

struct PendingSentence {
    index: u32,
    text: String,
    synth: Option<JoinHandle<Result<Bytes, BackendError>>>,
}

#[derive(Debug, Clone)]
struct ToolCallReq {
    id: String,
    name: String,
    input: Value,
}

#[derive(Default)]
struct RoundOutput {
    text: String,
    tool_calls: Vec<ToolCallReq>,
    stop_reason: String,
}

struct GenerationRun {
    backends: Backends,
    store: Arc<ConversationStore>,
    settings: GeneratorSettings,
    conversation_id: String,
    user_text: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<GeneratorEvent>,
    segmenter: SentenceSegmenter,
    tts_queue: VecDeque<PendingSentence>,
    next_sentence_index: u32,
    reasoning_index: u32,
    reasoning_buf: String,
    full_text: String,
}

impl GenerationRun {
    async fn drive(&mut self) -> Result<String, End> {
        // 1. Context assembly.
        let mut messages = assemble_history(
            &self.store,
            &self.conversation_id,
            self.settings.history_limit,
        )
        .map_err(|e| End::Failed(format!("store: {e}")))?;

        let memories = retrieve_memories(
            &self.store,
            &self.backends,
            &self.user_text,
            self.settings.memory_k,
        )
        .await;
        for m in &memories {
            self.send(GeneratorEvent::MemoryTraced {
                memory_id: m.memory_id.clone(),
                content: m.text.clone(),
                similarity: m.similarity,
                rank: m.rank,
                query: self.user_text.clone(),
            })
            .await?;
        }

        let system = compose_system(&self.settings.system_prompt, &memories);
        let tool_schemas = self.backends.tools.schemas();

        // 2. LLM streaming loop with tool continuation rounds.
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds > self.settings.max_tool_rounds {
                return Err(End::Failed(format!(
                    "tool loop exceeded {} rounds",
                    self.settings.max_tool_rounds
                )));
            }

            let round = self.stream_round(&system, &messages, &tool_schemas).await?;

            if round.tool_calls.is_empty() || round.stop_reason != "tool_use" {
                debug!(rounds, stop_reason = %round.stop_reason, "generation stream complete");
                break;
            }

            // Assistant turn: the text so far plus the tool_use blocks.
            let mut assistant_content: Vec<Value> = Vec::new();
            if !round.text.is_empty() {
                assistant_content.push(serde_json::json!({
                    "type": "text",
                    "text": round.text,
                }));
            }
            for call in &round.tool_calls {
                assistant_content.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.input,
                }));
            }
            messages.push(serde_json::json!({
                "role": "assistant",
                "content": assistant_content,
            }));

            // Execute each requested tool, then feed results back in.
            let mut result_blocks: Vec<Value> = Vec::new();
            for call in &round.tool_calls {
                self.send(GeneratorEvent::ToolRequested {
                    request_id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.input.clone(),
                })
                .await?;

                let outcome = self.execute_tool(call).await?;

                self.send(GeneratorEvent::ToolCompleted {
                    request_id: call.id.clone(),
                    success: !outcome.is_error,
                    result: (!outcome.is_error).then(|| outcome.value.clone()),
                    error_text: outcome
                        .is_error
                        .then(|| outcome.value.as_str().unwrap_or_default().to_string()),
                })
                .await?;

                result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": outcome.value.to_string(),
                    "is_error": outcome.is_error,
                }));
            }
            messages.push(serde_json::json!({
                "role": "user",
                "content": result_blocks,
            }));
        }

        // 3. Flush the unterminated tail, then drain TTS marking the last
        // sentence final.
        if let Some(tail) = self.segmenter.flush() {
            self.enqueue_sentence(tail).await?;
        }
        self.drain_tts().await?;

        info!(
            conversation = %self.conversation_id,
            sentences = self.next_sentence_index,
            "generation completed"
        );
        Ok(std::mem::take(&mut self.full_text))
    }

    /// One streamed LLM call. Retries within the budget only while nothing
    /// from this round has been consumed; a mid-stream failure after
    /// sentences went out is final.
    async fn stream_round(
        &mut self,
        system: &str,
        messages: &[Value],
        tools: &[parlance_backends::ToolSchema],
    ) -> Result<RoundOutput, End> {
        let mut last_failure = String::new();

        for attempt in 1..=LLM_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(End::Cancelled);
            }

            let req = ChatRequest {
                model: self.settings.model.clone(),
                system: system.to_string(),
                messages: messages.to_vec(),
                tools: tools.to_vec(),
                max_tokens: self.settings.max_tokens,
                temperature: self.settings.temperature,
            };

            let llm = Arc::clone(&self.backends.llm);
            let cancel = self.cancel.clone();
            let (ltx, mut lrx) = mpsc::channel::<LlmEvent>(64);
            let stream_task =
                tokio::spawn(async move { llm.stream_chat(&req, ltx, &cancel).await });

            let deadline = tokio::time::sleep(self.settings.llm_deadline);
            tokio::pin!(deadline);

            let mut round = RoundOutput::default();
            let mut consumed_any = false;
            let mut saw_done = false;
            let mut failure: Option<(String, bool)> = None; // (reason, retryable)

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        stream_task.abort();
                        failure = Some((
                            format!("llm deadline {}s exceeded", self.settings.llm_deadline.as_secs()),
                            true,
                        ));
                        break;
                    }
                    event = lrx.recv() => match event {
                        Some(LlmEvent::Token { text }) => {
                            consumed_any = true;
                            self.flush_reasoning().await?;
                            round.text.push_str(&text);
                            for sentence in self.segmenter.push(&text) {
                                self.enqueue_sentence(sentence).await?;
                            }
                        }
                        Some(LlmEvent::Reasoning { text }) => {
                            consumed_any = true;
                            self.reasoning_buf.push_str(&text);
                        }
                        Some(LlmEvent::ToolCall { id, name, input }) => {
                            consumed_any = true;
                            self.flush_reasoning().await?;
                            round.tool_calls.push(ToolCallReq { id, name, input });
                        }
                        Some(LlmEvent::Done { stop_reason, tokens_in, tokens_out }) => {
                            debug!(tokens_in, tokens_out, stop_reason = %stop_reason, "llm round done");
                            round.stop_reason = stop_reason;
                            saw_done = true;
                        }
                        Some(LlmEvent::Error { message }) => {
                            stream_task.abort();
                            failure = Some((message, !consumed_any));
                            break;
                        }
                        // Sender dropped: the stream task has returned.
                        None => break,
                    }
                }
            }

            if failure.is_none() {
                match stream_task.await {
                    Ok(Ok(())) => {
                        if !saw_done {
                            // Stream closed cleanly without a usage frame.
                            round.stop_reason = "end_turn".to_string();
                        }
                    }
                    Ok(Err(BackendError::Cancelled)) => return Err(End::Cancelled),
                    Ok(Err(e)) => {
                        failure = Some((e.to_string(), e.is_transient() && !consumed_any));
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(_) => {
                        failure = Some(("llm stream task panicked".to_string(), false));
                    }
                }
            } else {
                let _ = stream_task.await;
            }

            match failure {
                None => {
                    self.flush_reasoning().await?;
                    return Ok(round);
                }
                Some((reason, retryable)) => {
                    if self.cancel.is_cancelled() {
                        return Err(End::Cancelled);
                    }
                    if !retryable || attempt == LLM_ATTEMPTS {
                        return Err(End::Failed(format!("llm: {reason}")));
                    }
                    warn!(attempt, max = LLM_ATTEMPTS, %reason, "llm stream failed, retrying");
                    last_failure = reason;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(End::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(
                            retry::BASE_DELAY_MS << (attempt - 1)
                        )) => {}
                    }
                }
            }
        }

        Err(End::Failed(format!("llm: {last_failure}")))
    }

    /// Execute one tool call with its deadline and retry budget.
    /// Error outcomes are returned to the model, not turned into failures —
    /// the model decides how to proceed with a failing tool.
    async fn execute_tool(
        &self,
        call: &ToolCallReq,
    ) -> Result<parlance_backends::ToolOutcome, End> {
        let mut outcome = parlance_backends::ToolOutcome::error("tool not executed");
        for attempt in 1..=TOOL_ATTEMPTS {
            let attempt_result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(End::Cancelled),
                res = tokio::time::timeout(
                    self.settings.tool_deadline,
                    self.backends.tools.execute(&call.name, call.input.clone()),
                ) => res,
            };
            outcome = match attempt_result {
                Ok(o) => {
                    if !o.is_error {
                        return Ok(o);
                    }
                    warn!(tool = %call.name, attempt, "tool returned an error outcome");
                    o
                }
                Err(_) => parlance_backends::ToolOutcome::error(format!(
                    "tool deadline {}s exceeded",
                    self.settings.tool_deadline.as_secs()
                )),
            };
        }
        Ok(outcome)
    }

    /// Queue a completed sentence for TTS. Delivery is strictly in index
    /// order. One sentence is always held back so the terminal marker can
    /// be decided: sentence k is emitted once k+1 exists (not final) or the
    /// stream has ended (final iff nothing follows). Synthesis still starts
    /// at detection, so at most [`TTS_PARALLELISM`] run concurrently.
    async fn enqueue_sentence(&mut self, text: String) -> Result<(), End> {
        let index = self.next_sentence_index;
        self.next_sentence_index += 1;

        let synth = self.backends.tts.as_ref().map(|tts| {
            let tts = Arc::clone(tts);
            let cancel = self.cancel.clone();
            let deadline = self.settings.tts_deadline;
            let sentence = text.clone();
            tokio::spawn(async move {
                let attempt = retry::with_backoff("tts", TTS_ATTEMPTS, &cancel, || {
                    tts.synthesize(&sentence, &cancel)
                });
                match tokio::time::timeout(deadline, attempt).await {
                    Ok(res) => res,
                    Err(_) => Err(BackendError::Timeout {
                        secs: deadline.as_secs(),
                    }),
                }
            })
        });

        self.tts_queue.push_back(PendingSentence { index, text, synth });

        while self.tts_queue.len() > TTS_PARALLELISM - 1 {
            self.emit_front(false).await?;
        }
        Ok(())
    }

    /// Emit everything still queued; the last sentence carries the
    /// terminal marker.
    async fn drain_tts(&mut self) -> Result<(), End> {
        while !self.tts_queue.is_empty() {
            let is_final = self.tts_queue.len() == 1;
            self.emit_front(is_final).await?;
        }
        Ok(())
    }

    async fn emit_front(&mut self, is_final: bool) -> Result<(), End> {
        let Some(pending) = self.tts_queue.pop_front() else {
            return Ok(());
        };
        let audio = match pending.synth {
            Some(handle) => match handle.await {
                Ok(Ok(pcm)) => Some(SentenceAudio {
                    pcm,
                    format: AudioFormat::internal(),
                }),
                Ok(Err(BackendError::Cancelled)) => return Err(End::Cancelled),
                Ok(Err(e)) => return Err(End::Failed(format!("tts: {e}"))),
                Err(_) => return Err(End::Failed("internal".to_string())),
            },
            None => None,
        };

        self.full_text.push_str(&pending.text);
        self.send(GeneratorEvent::SentenceReady {
            index: pending.index,
            text: pending.text,
            is_final,
            audio,
        })
        .await
    }

    async fn flush_reasoning(&mut self) -> Result<(), End> {
        if self.reasoning_buf.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.reasoning_buf);
        let index = self.reasoning_index;
        self.reasoning_index += 1;
        self.send(GeneratorEvent::Reasoning { index, text }).await
    }

    /// Cancellation-aware bounded send. A closed channel means the actor
    /// is gone, which is handled like a cancel.
    async fn send(&self, event: GeneratorEvent) -> Result<(), End> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(End::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| End::Cancelled),
        }
    }

    /// Drain sub-tasks after the run ends, whatever the outcome. The token
    /// is cancelled so in-flight syntheses return promptly.
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        while let Some(pending) = self.tts_queue.pop_front() {
            if let Some(handle) = pending.synth {
                let _ = handle.await;
            }
        }
    }
}
