//! Per-conversation actor.
//!
//! One single-threaded cooperative unit owns all mutable state of one
//! conversation: the stanza ledger, the replay buffer, the active
//! generation, and the transport handle. Everything external — transport
//! callbacks, generator events, timers — arrives as a message on the
//! bounded inbox and is serialized through one `select!` loop.
//!
//! State machine: INITIALIZING → READY ⇄ GENERATING, with DEGRADED on
//! fatal store errors and teardown on idle TTL or explicit close.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parlance_audio::{AudioFrame, FramePacer, InboundWindow};
use parlance_backends::Backends;
use parlance_core::config::ParlanceConfig;
use parlance_generator::{GenerationHandle, GeneratorEvent, ResponseGenerator};
use parlance_protocol::envelope::{
    AcknowledgementBody, AssistantSentenceBody, Body, ConfigurationBody, ControlVariationBody,
    Envelope, ErrorBody, MemoryTraceBody, ReasoningStepBody, Severity, StartAnswerBody,
    ToolUseRequestBody, ToolUseResultBody, TranscriptionBody, UserMessageBody, VariationMode,
};
use parlance_protocol::{codec, Admission, ReplayBuffer, StanzaLedger};
use parlance_store::types::{CompletionStatus, Role, SentenceAudio, ToolStatus};
use parlance_store::{ConversationStore, NewMessage, StoreError};

use crate::error::RuntimeError;
use crate::transport::RoomTransport;

/// Inbound window size before a transcription request is issued (~500 ms
/// of 20 ms frames).
const ASR_CHUNK_FRAMES: usize = 25;

/// Runtime knobs shared by all actors of one dispatcher.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub replay_capacity: usize,
    pub replay_floor_warn: usize,
    pub idle_ttl: Duration,
    pub inbox_capacity: usize,
    /// Capability list advertised in the Configuration reply.
    pub features: Vec<String>,
}

impl RuntimeConfig {
    /// Derive runtime settings and the feature list from config + the
    /// configured backend stack.
    pub fn from_config(cfg: &ParlanceConfig, backends: &Backends) -> Self {
        let mut features = vec!["streaming".to_string()];
        if !backends.tools.is_empty() {
            features.push("tool_use".to_string());
        }
        if backends.tts.is_some() {
            features.push("voice".to_string());
        }
        if backends.embedding.is_some() {
            features.push("memory".to_string());
        }
        Self {
            replay_capacity: cfg.replay.capacity,
            replay_floor_warn: cfg.replay.floor_warn,
            idle_ttl: Duration::from_secs(cfg.actor.idle_ttl_seconds),
            inbox_capacity: cfg.actor.inbox_capacity,
            features,
        }
    }
}

/// Everything that can arrive on an actor's inbox.
#[derive(Debug)]
pub enum ActorEvent {
    /// A decoded client envelope.
    Inbound(Envelope),
    /// The dispatcher failed to decode a client frame.
    InboundMalformed { reason: String },
    /// One audio frame from the subscribed microphone track.
    AudioFrame(AudioFrame),
    ParticipantJoined { identity: String },
    ParticipantLeft { identity: String },
    TransportDisconnected,
    TransportReconnected,
    /// Administrative close; the actor tears down immediately.
    Close,
}

/// Cheap cloneable sender half of an actor's inbox.
#[derive(Clone)]
pub struct ActorHandle {
    pub room_id: String,
    inbox: mpsc::Sender<ActorEvent>,
}

impl ActorHandle {
    pub async fn send(&self, event: ActorEvent) -> Result<(), RuntimeError> {
        self.inbox
            .send(event)
            .await
            .map_err(|_| RuntimeError::NoActor {
                room: self.room_id.clone(),
            })
    }

    pub fn try_send(&self, event: ActorEvent) -> Result<(), RuntimeError> {
        self.inbox.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RuntimeError::InboxFull {
                room: self.room_id.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => RuntimeError::NoActor {
                room: self.room_id.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActorState {
    Initializing,
    Ready,
    Generating,
    Degraded,
}

/// State of the one in-flight generation.
struct ActiveGeneration {
    handle: GenerationHandle,
    /// The streaming assistant message row.
    message_id: String,
    /// Set after a cancel request; non-terminal generator events are
    /// discarded from then on.
    cancelling: bool,
    /// A user message that arrived mid-generation; starts the next
    /// generation once `Cancelled` lands.
    queued_user: Option<UserMessageBody>,
    /// Generator-side request id → persisted tool-use row id. Entries are
    /// removed on completion; leftovers are marked cancelled.
    tool_rows: HashMap<String, String>,
    audio_tx: mpsc::Sender<Bytes>,
    audio_cancel: CancellationToken,
    audio_task: JoinHandle<()>,
}

enum Wake {
    Inbox(Option<ActorEvent>),
    Generator(Option<GeneratorEvent>),
    Idle,
}

pub struct ConversationActor {
    room_id: String,
    config: RuntimeConfig,
    store: Arc<ConversationStore>,
    generator: Arc<ResponseGenerator>,
    backends: Backends,
    transport: Arc<dyn RoomTransport>,
    inbox: mpsc::Receiver<ActorEvent>,
    registry: Arc<DashMap<String, ActorHandle>>,

    state: ActorState,
    ledger: StanzaLedger,
    replay: ReplayBuffer,
    conversation_id: Option<String>,
    preferences: BTreeMap<String, String>,
    active: Option<ActiveGeneration>,
    detached: bool,
    inbound_audio: InboundWindow,
    idle_deadline: Instant,
}

impl ConversationActor {
    /// Spawn an actor for `room_id`. The dispatcher registers the returned
    /// handle under its registry lock (exactly one actor per room); the
    /// actor only unregisters itself at teardown.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        room_id: String,
        config: RuntimeConfig,
        store: Arc<ConversationStore>,
        generator: Arc<ResponseGenerator>,
        backends: Backends,
        transport: Arc<dyn RoomTransport>,
        registry: Arc<DashMap<String, ActorHandle>>,
    ) -> ActorHandle {
        let (tx, rx) = mpsc::channel(config.inbox_capacity);
        let handle = ActorHandle {
            room_id: room_id.clone(),
            inbox: tx,
        };

        let idle_deadline = Instant::now() + config.idle_ttl;
        let replay = ReplayBuffer::new(config.replay_capacity);
        let actor = Self {
            room_id,
            config,
            store,
            generator,
            backends,
            transport,
            inbox: rx,
            registry,
            state: ActorState::Initializing,
            ledger: StanzaLedger::new(),
            replay,
            conversation_id: None,
            preferences: BTreeMap::new(),
            active: None,
            detached: false,
            inbound_audio: InboundWindow::default(),
            idle_deadline,
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        info!(room = %self.room_id, "conversation actor started");

        loop {
            let wake = {
                let idle = tokio::time::sleep_until(self.idle_deadline);
                tokio::pin!(idle);
                let gen_rx = self.active.as_mut().map(|a| &mut a.handle.events);
                let inbox = &mut self.inbox;
                tokio::select! {
                    event = inbox.recv() => Wake::Inbox(event),
                    event = async {
                        match gen_rx {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Wake::Generator(event),
                    _ = &mut idle => Wake::Idle,
                }
            };

            match wake {
                Wake::Inbox(Some(event)) => {
                    self.touch_idle();
                    if self.handle_actor_event(event).await {
                        break;
                    }
                }
                Wake::Inbox(None) => break,
                Wake::Generator(Some(event)) => self.handle_generator_event(event).await,
                Wake::Generator(None) => {
                    // Channel closed without a terminal event — the task
                    // died harder than the panic guard. Fail the message.
                    self.handle_generator_event(GeneratorEvent::Failed {
                        reason: "internal".to_string(),
                    })
                    .await;
                }
                Wake::Idle => {
                    if self.state == ActorState::Generating {
                        self.touch_idle();
                        continue;
                    }
                    info!(room = %self.room_id, "idle TTL expired");
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.registry.remove(&self.room_id);
        if let Some(active) = self.active.take() {
            active.handle.cancel();
            active.audio_cancel.cancel();
            let _ = self
                .store
                .update_message_status(&active.message_id, CompletionStatus::Failed, None);
            active.handle.join().await;
            let _ = active.audio_task.await;
        }
        self.checkpoint();
        info!(room = %self.room_id, "conversation actor torn down");
    }

    fn touch_idle(&mut self) {
        self.idle_deadline = Instant::now() + self.config.idle_ttl;
    }

    /// Returns true when the actor should tear down.
    async fn handle_actor_event(&mut self, event: ActorEvent) -> bool {
        match event {
            ActorEvent::Inbound(env) => self.handle_inbound(env).await,
            ActorEvent::InboundMalformed { reason } => {
                self.emit_error(Severity::Warning, "protocol-invalid", &reason)
                    .await;
            }
            ActorEvent::AudioFrame(frame) => self.handle_audio_frame(frame).await,
            ActorEvent::ParticipantJoined { identity } => {
                debug!(room = %self.room_id, %identity, "participant joined");
            }
            ActorEvent::ParticipantLeft { identity } => {
                debug!(room = %self.room_id, %identity, "participant left");
            }
            ActorEvent::TransportDisconnected => {
                info!(room = %self.room_id, "transport disconnected, actor detached");
                self.detached = true;
            }
            ActorEvent::TransportReconnected => {
                info!(room = %self.room_id, "transport reconnected");
                self.detached = false;
            }
            ActorEvent::Close => return true,
        }
        false
    }

    // -- inbound envelopes --------------------------------------------------

    async fn handle_inbound(&mut self, env: Envelope) {
        if env.body.is_unknown() {
            // Reserved/unknown codes are logged and never reach the state
            // machine.
            debug!(
                room = %self.room_id,
                type_code = env.body.type_code(),
                stanza_id = env.stanza_id,
                "unknown envelope type routed to sink"
            );
            return;
        }

        match self.ledger.admit(env.stanza_id) {
            Admission::Accepted => {}
            Admission::Duplicate => {
                debug!(room = %self.room_id, stanza_id = env.stanza_id, "duplicate stanza, ack and discard");
                self.emit_unsequenced_ack(env.stanza_id).await;
                return;
            }
            Admission::Stale => {
                warn!(room = %self.room_id, stanza_id = env.stanza_id, "stale stanza dropped");
                return;
            }
        }

        let stanza_id = env.stanza_id;
        match env.body {
            Body::Configuration(body) => self.handle_configuration(stanza_id, body).await,
            body if self.state == ActorState::Initializing => {
                warn!(room = %self.room_id, body = body.name(), "envelope before configuration handshake");
                self.emit_error(
                    Severity::Warning,
                    "protocol-invalid",
                    "configuration handshake required first",
                )
                .await;
            }
            // Degraded actors answer only ControlStop and Configuration;
            // new user messages get a distinct error, the rest is dropped.
            body if self.state == ActorState::Degraded
                && !matches!(body, Body::UserMessage(_) | Body::ControlStop) =>
            {
                debug!(room = %self.room_id, body = body.name(), "dropped while degraded");
            }
            Body::UserMessage(body) => self.handle_user_message(stanza_id, body).await,
            Body::ControlStop => self.handle_control_stop(stanza_id).await,
            Body::ControlVariation(body) => self.handle_control_variation(stanza_id, body).await,
            Body::Commentary(body) => {
                if let Err(e) =
                    self.store
                        .record_commentary(&body.message_id, &body.content, &body.category)
                {
                    self.store_failure(e).await;
                    return;
                }
                self.emit_ack(stanza_id).await;
            }
            Body::AudioChunk(body) => {
                for data in body.frames {
                    let frame = AudioFrame::new(data, parlance_audio::AudioFormat::internal());
                    self.inbound_audio.push(frame);
                }
                self.transcribe_window(false).await;
                self.emit_ack(stanza_id).await;
            }
            Body::Acknowledgement(body) => {
                debug!(
                    room = %self.room_id,
                    acknowledged = body.acknowledged_stanza_id,
                    "client acknowledgement"
                );
            }
            body => {
                warn!(room = %self.room_id, body = body.name(), "server-only envelope type from client");
                self.emit_error(
                    Severity::Warning,
                    "protocol-invalid",
                    &format!("unexpected {} envelope from client", body.name()),
                )
                .await;
            }
        }
        self.checkpoint();
    }

    async fn handle_configuration(&mut self, stanza_id: i32, body: ConfigurationBody) {
        let declared = body
            .conversation_id
            .clone()
            .filter(|id| !id.is_empty());

        match (self.conversation_id.clone(), declared) {
            // First handshake, no id: create a conversation.
            (None, None) => {
                let prefs = preferences_from(&body);
                match self.store.create_conversation(&prefs) {
                    Ok(conv) => {
                        info!(room = %self.room_id, conversation = %conv.id, "conversation created");
                        self.conversation_id = Some(conv.id.clone());
                        self.preferences = prefs;
                        self.state = ActorState::Ready;
                        let reply = Body::Configuration(ConfigurationBody {
                            conversation_id: Some(conv.id),
                            features: self.config.features.clone(),
                            ..Default::default()
                        });
                        self.emit(reply).await;
                        self.emit_ack(stanza_id).await;
                    }
                    Err(e) => self.store_failure(e).await,
                }
            }

            // First handshake with an id: resume an existing conversation.
            (None, Some(id)) => match self.store.load_conversation(&id) {
                Ok(conv) => {
                    info!(room = %self.room_id, conversation = %conv.id, "conversation resumed");
                    self.ledger = StanzaLedger::resume(
                        conv.last_client_stanza.max(stanza_id),
                        conv.last_server_stanza,
                    );
                    self.preferences = conv.preferences.clone();
                    self.conversation_id = Some(conv.id);
                    self.state = ActorState::Ready;
                    self.resume_replay(body.last_sequence_seen.unwrap_or(0))
                        .await;
                }
                Err(StoreError::NotFound { .. }) => {
                    self.emit_error(
                        Severity::Error,
                        "not-found",
                        &format!("unknown conversation: {id}"),
                    )
                    .await;
                }
                Err(e) => self.store_failure(e).await,
            },

            // Mid-session handshake for the same conversation. A declared
            // watermark requests suffix replay (reconnection); without one
            // this is a preference update.
            (Some(current), Some(id)) if current == id => {
                if let Some(last_seen) = body.last_sequence_seen {
                    self.resume_replay(last_seen).await;
                } else {
                    self.update_preferences(&body).await;
                    self.emit_ack(stanza_id).await;
                }
            }

            // Mid-session preference update without an id.
            (Some(_), None) => {
                self.update_preferences(&body).await;
                self.emit_ack(stanza_id).await;
            }

            // A different conversation id on an established actor.
            (Some(current), Some(other)) => {
                warn!(room = %self.room_id, %current, %other, "configuration names a different conversation");
                self.emit_error(
                    Severity::Error,
                    "protocol-invalid",
                    "configuration names a different conversation",
                )
                .await;
            }
        }
    }

    async fn update_preferences(&mut self, body: &ConfigurationBody) {
        let incoming = preferences_from(body);
        if incoming.is_empty() {
            return;
        }
        self.preferences.extend(incoming);
        let Some(conv_id) = self.conversation_id.clone() else {
            return;
        };
        if let Err(e) = self.store.update_preferences(&conv_id, &self.preferences) {
            self.store_failure(e).await;
        }
    }

    /// Reconnect path: acknowledge the declared watermark, flag a gap when
    /// the suffix predates the replay floor, then retransmit the resident
    /// suffix verbatim. Retransmissions keep their original stanza ids and
    /// are not re-appended to the buffer.
    async fn resume_replay(&mut self, last_seen: u32) {
        self.detached = false;
        self.emit_resume_ack(last_seen).await;

        let slice = self.replay.since(last_seen);
        let newest = self.ledger.last_server().unsigned_abs();
        let gap = slice.gap || (slice.entries.is_empty() && last_seen < newest);
        if gap {
            self.emit(Body::Error(ErrorBody {
                severity: Severity::Warning,
                error_code: "replay-gap".to_string(),
                text: format!(
                    "envelopes after {} are no longer buffered; replay starts at {}",
                    last_seen,
                    self.replay.floor()
                ),
            }))
            .await;
        }

        let mut replayed = 0usize;
        for entry in &slice.entries {
            if self
                .transport
                .publish_data(entry.bytes.clone(), true)
                .await
                .is_err()
            {
                self.detached = true;
                break;
            }
            replayed += 1;
        }
        info!(room = %self.room_id, replayed, gap, last_seen, "reconnect replay complete");
    }

    async fn handle_user_message(&mut self, stanza_id: i32, body: UserMessageBody) {
        match self.state {
            ActorState::Degraded => {
                self.emit_error(
                    Severity::Error,
                    "service-degraded",
                    "storage unavailable; not accepting new messages",
                )
                .await;
            }
            ActorState::Generating => {
                // A new user message interrupts the running answer.
                self.emit_ack(stanza_id).await;
                if let Some(active) = self.active.as_mut() {
                    active.queued_user = Some(body);
                    active.cancelling = true;
                    active.handle.cancel();
                    active.audio_cancel.cancel();
                }
            }
            _ => {
                self.emit_ack(stanza_id).await;
                self.start_generation(body).await;
            }
        }
    }

    async fn handle_control_stop(&mut self, stanza_id: i32) {
        if let Some(active) = self.active.as_mut() {
            info!(room = %self.room_id, message = %active.message_id, "user interrupt, cancelling generator");
            active.cancelling = true;
            active.handle.cancel();
            active.audio_cancel.cancel();
        }
        self.emit_ack(stanza_id).await;
    }

    async fn handle_control_variation(&mut self, stanza_id: i32, body: ControlVariationBody) {
        match (body.mode, self.state) {
            (VariationMode::Retry, ActorState::Ready) => {
                // Re-answer the user message behind the target assistant
                // message, with its original content.
                let user = self
                    .store
                    .find_message(&body.target_message_id)
                    .ok()
                    .flatten()
                    .and_then(|assistant| assistant.previous_id)
                    .and_then(|prev| self.store.find_message(&prev).ok().flatten())
                    .filter(|m| m.role == Role::User);

                match user {
                    Some(user) => {
                        self.emit_ack(stanza_id).await;
                        self.start_generation_for(user.id.clone(), user.contents.clone())
                            .await;
                    }
                    None => {
                        self.emit_error(
                            Severity::Warning,
                            "protocol-invalid",
                            "retry target has no user message",
                        )
                        .await;
                    }
                }
            }
            (VariationMode::Edit, ActorState::Generating) => {
                // Cancel; the superseding user message follows from the
                // client and will link back via previousId.
                if let Some(active) = self.active.as_mut() {
                    active.cancelling = true;
                    active.handle.cancel();
                    active.audio_cancel.cancel();
                }
                self.emit_ack(stanza_id).await;
            }
            _ => {
                self.emit_error(
                    Severity::Warning,
                    "protocol-invalid",
                    "variation not applicable in current state",
                )
                .await;
            }
        }
    }

    // -- generation ---------------------------------------------------------

    async fn start_generation(&mut self, body: UserMessageBody) {
        let Some(conv_id) = self.conversation_id.clone() else {
            return;
        };
        let appended = self.store.append_message(NewMessage {
            conversation_id: &conv_id,
            role: Some(Role::User),
            contents: &body.content,
            previous_id: body.previous_id.as_deref(),
            local_id: body.local_id.as_deref(),
            id: Some(&body.id),
            completion_status: Some(CompletionStatus::Completed),
        });
        let user = match appended {
            Ok(m) => m,
            Err(e) => {
                self.store_failure(e).await;
                return;
            }
        };
        self.start_generation_for(user.id, user.contents).await;
    }

    /// Create the streaming assistant row, announce it, and spawn the
    /// generator. Used by both the normal path and retry.
    async fn start_generation_for(&mut self, user_message_id: String, user_text: String) {
        let Some(conv_id) = self.conversation_id.clone() else {
            return;
        };
        let assistant = match self.store.append_message(NewMessage {
            conversation_id: &conv_id,
            role: Some(Role::Assistant),
            contents: "",
            completion_status: Some(CompletionStatus::Streaming),
            ..Default::default()
        }) {
            Ok(m) => m,
            Err(e) => {
                self.store_failure(e).await;
                return;
            }
        };

        self.emit(Body::StartAnswer(StartAnswerBody {
            id: assistant.id.clone(),
            previous_id: user_message_id,
        }))
        .await;

        let handle = self.generator.spawn(&conv_id, &user_text);
        let audio_cancel = CancellationToken::new();
        let (audio_tx, audio_task) =
            spawn_outbound_audio(Arc::clone(&self.transport), audio_cancel.clone());

        self.active = Some(ActiveGeneration {
            handle,
            message_id: assistant.id,
            cancelling: false,
            queued_user: None,
            tool_rows: HashMap::new(),
            audio_tx,
            audio_cancel,
            audio_task,
        });
        self.state = ActorState::Generating;
    }

    async fn handle_generator_event(&mut self, event: GeneratorEvent) {
        let (cancelling, message_id) = match self.active.as_ref() {
            Some(a) => (a.cancelling, a.message_id.clone()),
            None => return,
        };
        if cancelling && !event.is_terminal() {
            // Cancellation atomicity: once the stop is acknowledged,
            // nothing from the doomed generator reaches the wire.
            return;
        }

        match event {
            GeneratorEvent::Reasoning { index, text } => {
                self.emit(Body::ReasoningStep(ReasoningStepBody {
                    message_id,
                    index,
                    text,
                }))
                .await;
            }

            GeneratorEvent::MemoryTraced {
                memory_id,
                content,
                similarity,
                rank,
                query,
            } => {
                if let Some(conv_id) = self.conversation_id.clone() {
                    if let Err(e) = self.store.record_memory_use(
                        &conv_id, &message_id, &memory_id, &query, similarity, rank,
                    ) {
                        self.store_failure(e).await;
                        return;
                    }
                }
                self.emit(Body::MemoryTrace(MemoryTraceBody {
                    memory_id,
                    message_id,
                    content,
                    similarity,
                }))
                .await;
            }

            GeneratorEvent::ToolRequested {
                request_id,
                name,
                arguments,
            } => {
                let row = match self.store.record_tool_use(&message_id, &name, &arguments) {
                    Ok(row) => row,
                    Err(e) => {
                        self.store_failure(e).await;
                        return;
                    }
                };
                let _ = self
                    .store
                    .update_tool_use(&row.id, ToolStatus::Running, None, None);
                if let Some(active) = self.active.as_mut() {
                    active.tool_rows.insert(request_id, row.id.clone());
                }
                self.emit(Body::ToolUseRequest(ToolUseRequestBody {
                    id: row.id,
                    message_id,
                    tool_name: name,
                    arguments,
                }))
                .await;
            }

            GeneratorEvent::ToolCompleted {
                request_id,
                success,
                result,
                error_text,
            } => {
                let row_id = self
                    .active
                    .as_mut()
                    .and_then(|a| a.tool_rows.remove(&request_id))
                    .unwrap_or(request_id);
                let status = if success {
                    ToolStatus::Success
                } else {
                    ToolStatus::Error
                };
                if let Err(e) =
                    self.store
                        .update_tool_use(&row_id, status, result.as_ref(), error_text.as_deref())
                {
                    self.store_failure(e).await;
                    return;
                }
                self.emit(Body::ToolUseResult(ToolUseResultBody {
                    request_id: row_id,
                    success,
                    result,
                    error_text,
                }))
                .await;
            }

            GeneratorEvent::SentenceReady {
                index,
                text,
                is_final,
                audio,
            } => {
                let sentence = match self.store.append_sentence(&message_id, index, &text) {
                    Ok(s) => s,
                    Err(e) => {
                        self.store_failure(e).await;
                        return;
                    }
                };
                if let Some(a) = &audio {
                    let format = a.format;
                    let _ = self.store.update_sentence_audio(
                        &sentence.id,
                        &SentenceAudio {
                            format: format.tag(),
                            frames: (a.pcm.len() / format.frame_bytes(20).max(1)) as u32,
                            duration_ms: format.duration_ms(a.pcm.len()),
                            byte_size: a.pcm.len() as u64,
                        },
                    );
                }
                let _ = self.store.finalize_sentence(&sentence.id);

                self.emit(Body::AssistantSentence(AssistantSentenceBody {
                    message_id,
                    index,
                    text,
                    is_final,
                }))
                .await;

                if let (Some(a), Some(active)) = (audio, self.active.as_ref()) {
                    // Suspension point: pacing backpressure propagates from
                    // here through the event channel to the generator.
                    let _ = active.audio_tx.send(a.pcm).await;
                }
            }

            GeneratorEvent::Completed { full_text } => {
                let active = self.active.take().expect("checked above");
                if let Err(e) = self.store.update_message_status(
                    &active.message_id,
                    CompletionStatus::Completed,
                    Some(&full_text),
                ) {
                    self.finish_with_store_failure(e).await;
                    return;
                }
                debug!(room = %self.room_id, message = %active.message_id, "assistant message completed");
                self.state = ActorState::Ready;
                self.checkpoint();

                // A user message may have raced the final sentence.
                if let Some(next) = active.queued_user {
                    self.start_generation(next).await;
                }
            }

            GeneratorEvent::Cancelled => {
                let active = self.active.take().expect("checked above");
                self.finalize_failed_message(&active).await;
                active.audio_cancel.cancel();
                self.state = ActorState::Ready;
                self.checkpoint();

                if let Some(next) = active.queued_user {
                    self.start_generation(next).await;
                }
            }

            GeneratorEvent::Failed { reason } => {
                let active = self.active.take().expect("checked above");
                self.finalize_failed_message(&active).await;
                active.audio_cancel.cancel();
                self.emit_error(Severity::Error, "backend-failed", &reason).await;
                self.state = ActorState::Ready;
                self.checkpoint();

                if let Some(next) = active.queued_user {
                    self.start_generation(next).await;
                }
            }
        }
    }

    /// Truncate the assistant message to its delivered sentences, mark it
    /// failed, and cancel any tool rows still pending.
    async fn finalize_failed_message(&mut self, active: &ActiveGeneration) {
        let partial: String = self
            .store
            .sentences_for(&active.message_id)
            .map(|sentences| sentences.iter().map(|s| s.text.as_str()).collect())
            .unwrap_or_default();
        let _ = self.store.update_message_status(
            &active.message_id,
            CompletionStatus::Failed,
            Some(&partial),
        );
        for row_id in active.tool_rows.values() {
            let _ = self
                .store
                .update_tool_use(row_id, ToolStatus::Cancelled, None, None);
        }
    }

    // -- audio --------------------------------------------------------------

    async fn handle_audio_frame(&mut self, frame: AudioFrame) {
        match frame.to_internal() {
            Ok(internal) => self.inbound_audio.push(internal),
            Err(e) => {
                debug!(room = %self.room_id, error = %e, "dropping unsupported audio frame");
                return;
            }
        }
        if self.inbound_audio.len() >= ASR_CHUNK_FRAMES {
            self.transcribe_window(true).await;
        }
    }

    /// Drain the inbound window through the recognizer and emit
    /// Transcription envelopes. A missing ASR backend just drops audio.
    async fn transcribe_window(&mut self, interim: bool) {
        let Some(asr) = self.backends.asr.clone() else {
            self.inbound_audio.drain();
            return;
        };
        if self.inbound_audio.is_empty() {
            return;
        }
        let mut pcm = Vec::new();
        let mut rate = parlance_audio::AudioFormat::internal().sample_rate;
        for frame in self.inbound_audio.drain() {
            rate = frame.format.sample_rate;
            pcm.extend_from_slice(&frame.data);
        }
        match asr.transcribe(&pcm, rate, interim).await {
            Ok(segments) => {
                for segment in segments {
                    self.emit(Body::Transcription(TranscriptionBody {
                        text: segment.text,
                        is_final: segment.is_final,
                        confidence: segment.confidence,
                    }))
                    .await;
                }
            }
            Err(e) => warn!(room = %self.room_id, error = %e, "transcription failed"),
        }
    }

    // -- emission -----------------------------------------------------------

    /// Emit one server envelope: draw the next stanza id, append to the
    /// replay buffer, then hand to the transport. Replay-before-publish is
    /// the invariant that makes reconnection lossless.
    async fn emit(&mut self, body: Body) {
        let conv_id = self.conversation_id.clone().unwrap_or_default();
        let stanza_id = self.ledger.next_server();
        let env = Envelope::new(stanza_id, conv_id, body);

        let bytes = match codec::encode(&env) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                error!(room = %self.room_id, error = %e, "failed to encode outbound envelope");
                return;
            }
        };

        let headroom = self.config.replay_capacity.saturating_sub(self.replay.len());
        if headroom == self.config.replay_floor_warn {
            debug!(
                room = %self.room_id,
                floor = self.replay.floor(),
                "replay buffer approaching capacity"
            );
        }
        self.replay.push(stanza_id, bytes.clone());

        if self.detached {
            return; // buffered for replay; nobody is listening right now
        }
        if let Err(e) = self.transport.publish_data(bytes, true).await {
            warn!(room = %self.room_id, error = %e, "publish failed, detaching");
            self.detached = true;
        }
    }

    /// Sequenced acknowledgement of an accepted client stanza.
    async fn emit_ack(&mut self, acknowledged: i32) {
        let conv_id = self.conversation_id.clone().unwrap_or_default();
        self.emit(Body::Acknowledgement(AcknowledgementBody {
            acknowledged_stanza_id: acknowledged,
            conversation_id: conv_id,
        }))
        .await;
    }

    /// Acknowledgement outside the sequence machinery: duplicates and the
    /// reconnect handshake. Reuses the last server stanza id so signs stay
    /// consistent while no new id is consumed and no state mutates.
    async fn emit_unsequenced_ack(&mut self, acknowledged: i32) {
        let conv_id = self.conversation_id.clone().unwrap_or_default();
        let env = Envelope::new(
            self.ledger.last_server().min(-1),
            conv_id.clone(),
            Body::Acknowledgement(AcknowledgementBody {
                acknowledged_stanza_id: acknowledged,
                conversation_id: conv_id,
            }),
        );
        if let Ok(bytes) = codec::encode(&env) {
            if !self.detached {
                let _ = self.transport.publish_data(Bytes::from(bytes), true).await;
            }
        }
    }

    async fn emit_resume_ack(&mut self, last_seen: u32) {
        self.emit_unsequenced_ack(last_seen as i32).await;
    }

    async fn emit_error(&mut self, severity: Severity, code: &str, text: &str) {
        self.emit(Body::Error(ErrorBody {
            severity,
            error_code: code.to_string(),
            text: text.to_string(),
        }))
        .await;
    }

    // -- failure handling ---------------------------------------------------

    async fn store_failure(&mut self, e: StoreError) {
        if e.is_fatal() {
            error!(room = %self.room_id, error = %e, "fatal store error, degrading");
            self.emit_error(Severity::Fatal, "store-failed", &e.to_string())
                .await;
            if let Some(active) = self.active.as_mut() {
                active.cancelling = true;
                active.handle.cancel();
                active.audio_cancel.cancel();
            }
            self.state = ActorState::Degraded;
        } else {
            warn!(room = %self.room_id, error = %e, "store operation failed");
            self.emit_error(Severity::Error, "store-failed", &e.to_string())
                .await;
        }
    }

    async fn finish_with_store_failure(&mut self, e: StoreError) {
        self.state = ActorState::Ready;
        self.store_failure(e).await;
    }

    /// Persist the stanza counters; failures here are logged, not fatal —
    /// the next successful write re-checkpoints.
    fn checkpoint(&self) {
        if let Some(conv_id) = &self.conversation_id {
            if let Err(e) = self.store.checkpoint_stanzas(
                conv_id,
                self.ledger.last_client(),
                self.ledger.last_server(),
            ) {
                warn!(room = %self.room_id, error = %e, "stanza checkpoint failed");
            }
        }
    }
}

/// Map Configuration fields into the conversation preference map.
fn preferences_from(body: &ConfigurationBody) -> BTreeMap<String, String> {
    let mut prefs = BTreeMap::new();
    if let Some(lang) = &body.preferred_language {
        prefs.insert("preferred_language".to_string(), lang.clone());
    }
    if let Some(device) = &body.device {
        prefs.insert("device".to_string(), device.clone());
    }
    if let Some(version) = &body.client_version {
        prefs.insert("client_version".to_string(), version.clone());
    }
    prefs
}

/// Per-generation outbound audio bridge: sentence PCM in, paced 20 ms
/// frames out to the room's audio track. The channel is shallow so pacing
/// backpressure reaches the actor (and from there the generator).
fn spawn_outbound_audio(
    transport: Arc<dyn RoomTransport>,
    cancel: CancellationToken,
) -> (mpsc::Sender<Bytes>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(2);
    let task = tokio::spawn(async move {
        let pacer = FramePacer::default();
        let (frame_tx, mut frame_rx) = mpsc::channel::<AudioFrame>(8);

        let publisher = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if transport.publish_audio_frame(frame).await.is_err() {
                    break;
                }
            }
        });

        while let Some(pcm) = rx.recv().await {
            match pacer.pace(pcm, &frame_tx, &cancel).await {
                Ok(stats) if stats.cancelled => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        drop(frame_tx);
        let _ = publisher.await;
    });
    (tx, task)
}
