// End-to-end conversation scenarios over the dispatcher: handshake,
// streamed answers, interrupts, duplicates, and reconnect replay.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::Connection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parlance_backends::tool::{Tool, ToolOutcome, ToolRegistry};
use parlance_backends::{Backends, ChatRequest, LanguageBackend, LlmEvent};
use parlance_generator::{GeneratorSettings, ResponseGenerator};
use parlance_protocol::envelope::{
    Body, ConfigurationBody, ControlVariationBody, Envelope, Severity, UserMessageBody,
    VariationMode,
};
use parlance_protocol::{codec, decode};
use parlance_runtime::{Dispatcher, MemoryTransport, RuntimeConfig};
use parlance_store::types::{CompletionStatus, ToolStatus};
use parlance_store::ConversationStore;

const ROOM: &str = "room-test";

/// One scripted LLM round; `park` keeps the stream open (watching the
/// cancellation token) after the events are sent, modelling a stalled
/// backend mid-answer.
struct Script {
    events: Vec<LlmEvent>,
    park: bool,
}

struct ScriptedLlm {
    rounds: Mutex<VecDeque<Script>>,
}

impl ScriptedLlm {
    fn new(rounds: Vec<Script>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
        }
    }
}

#[async_trait]
impl LanguageBackend for ScriptedLlm {
    async fn stream_chat(
        &self,
        _req: &ChatRequest,
        tx: mpsc::Sender<LlmEvent>,
        cancel: &CancellationToken,
    ) -> parlance_backends::Result<()> {
        let script = self.rounds.lock().unwrap().pop_front();
        match script {
            Some(script) => {
                for event in script.events {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                if script.park {
                    cancel.cancelled().await;
                    return Err(parlance_backends::BackendError::Cancelled);
                }
                Ok(())
            }
            None => {
                cancel.cancelled().await;
                Err(parlance_backends::BackendError::Cancelled)
            }
        }
    }
}

fn answer(text: &str) -> Script {
    let mut events: Vec<LlmEvent> = text
        .as_bytes()
        .chunks(11)
        .map(|c| LlmEvent::Token {
            text: String::from_utf8_lossy(c).to_string(),
        })
        .collect();
    events.push(LlmEvent::Done {
        stop_reason: "end_turn".to_string(),
        tokens_in: 10,
        tokens_out: 20,
    });
    Script {
        events,
        park: false,
    }
}

struct Weather;

#[async_trait]
impl Tool for Weather {
    fn name(&self) -> &str {
        "get_weather"
    }
    fn description(&self) -> &str {
        "Current weather for a city"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _input: serde_json::Value) -> ToolOutcome {
        ToolOutcome::success(serde_json::json!({"temperatureC": 22, "condition": "sunny"}))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    transport: Arc<MemoryTransport>,
    store: Arc<ConversationStore>,
}

fn harness_with(rounds: Vec<Script>, tools: ToolRegistry, replay_capacity: usize) -> Harness {
    let conn = Connection::open_in_memory().unwrap();
    parlance_store::db::init_db(&conn).unwrap();
    let store = Arc::new(ConversationStore::new(conn));

    let backends = Backends {
        llm: Arc::new(ScriptedLlm::new(rounds)),
        tts: None,
        asr: None,
        embedding: None,
        tools: Arc::new(tools),
    };
    let settings = GeneratorSettings::new(&parlance_core::config::LlmConfig::default());
    let generator = Arc::new(ResponseGenerator::new(
        backends.clone(),
        Arc::clone(&store),
        settings,
    ));

    let config = RuntimeConfig {
        replay_capacity,
        replay_floor_warn: 2,
        idle_ttl: Duration::from_secs(300),
        inbox_capacity: 64,
        features: vec!["streaming".to_string(), "tool_use".to_string()],
    };
    let dispatcher = Dispatcher::new(config, Arc::clone(&store), generator, backends);
    Harness {
        dispatcher,
        transport: Arc::new(MemoryTransport::new()),
        store,
    }
}

fn harness(rounds: Vec<Script>) -> Harness {
    harness_with(rounds, ToolRegistry::new(), 256)
}

impl Harness {
    async fn join(&self) {
        self.dispatcher
            .on_participant_joined(ROOM, "client-1", Arc::clone(&self.transport) as _)
            .await;
    }

    async fn send(&self, env: &Envelope) {
        let bytes = Bytes::from(codec::encode(env).unwrap());
        self.dispatcher.on_data_received(ROOM, bytes).await;
    }

    fn published(&self) -> Vec<Envelope> {
        self.transport
            .published()
            .iter()
            .map(|b| decode(b).unwrap())
            .collect()
    }

    /// Poll until the published envelope list satisfies `pred`.
    async fn wait_until(&self, pred: impl Fn(&[Envelope]) -> bool) -> Vec<Envelope> {
        for _ in 0..500 {
            let envs = self.published();
            if pred(&envs) {
                return envs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met; published: {:#?}", self.published());
    }
}

fn configure(stanza_id: i32, conversation_id: &str, last_seen: Option<u32>) -> Envelope {
    Envelope::new(
        stanza_id,
        conversation_id,
        Body::Configuration(ConfigurationBody {
            conversation_id: Some(conversation_id.to_string()),
            last_sequence_seen: last_seen,
            ..Default::default()
        }),
    )
}

fn user_message(stanza_id: i32, conversation_id: &str, id: &str, content: &str) -> Envelope {
    Envelope::new(
        stanza_id,
        conversation_id,
        Body::UserMessage(UserMessageBody {
            id: id.to_string(),
            previous_id: None,
            content: content.to_string(),
            local_id: None,
        }),
    )
}

fn conversation_id_from(envs: &[Envelope]) -> Option<String> {
    envs.iter().find_map(|e| match &e.body {
        Body::Configuration(c) => c.conversation_id.clone(),
        _ => None,
    })
}

fn sentences_of(envs: &[Envelope]) -> Vec<(i32, u32, String, bool)> {
    envs.iter()
        .filter_map(|e| match &e.body {
            Body::AssistantSentence(s) => {
                Some((e.stanza_id, s.index, s.text.clone(), s.is_final))
            }
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_new_conversation_basic_qa() {
    let h = harness(vec![answer(
        "The capital of France is Paris. It is in the north-central region.",
    )]);
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    let envs = h
        .wait_until(|envs| envs.len() >= 2)
        .await;

    // Configuration reply with an assigned id, then the ack.
    match &envs[0].body {
        Body::Configuration(c) => {
            let id = c.conversation_id.as_deref().unwrap();
            assert!(id.starts_with("conv_"));
            assert!(c.features.contains(&"streaming".to_string()));
        }
        other => panic!("expected configuration reply, got {other:?}"),
    }
    assert_eq!(envs[0].stanza_id, -1);
    match &envs[1].body {
        Body::Acknowledgement(a) => assert_eq!(a.acknowledged_stanza_id, 1),
        other => panic!("expected ack, got {other:?}"),
    }
    assert_eq!(envs[1].stanza_id, -2);
    let conv_id = conversation_id_from(&envs).unwrap();

    h.send(&user_message(3, &conv_id, "msg_u1", "What is the capital of France?"))
        .await;
    let envs = h
        .wait_until(|envs| sentences_of(envs).iter().any(|(_, _, _, is_final)| *is_final))
        .await;

    // Ack, StartAnswer, two sentences — with strictly decreasing stanzas.
    assert!(matches!(&envs[2].body, Body::Acknowledgement(a) if a.acknowledged_stanza_id == 3));
    assert_eq!(envs[2].stanza_id, -3);
    let assistant_id = match &envs[3].body {
        Body::StartAnswer(s) => {
            assert_eq!(s.previous_id, "msg_u1");
            s.id.clone()
        }
        other => panic!("expected start-answer, got {other:?}"),
    };
    assert_eq!(envs[3].stanza_id, -4);

    let sentences = sentences_of(&envs);
    assert_eq!(sentences.len(), 2);
    assert_eq!(sentences[0].0, -5);
    assert_eq!(sentences[0].1, 0);
    assert!(!sentences[0].3);
    assert_eq!(sentences[1].0, -6);
    assert!(sentences[1].3);

    // Sign invariant over everything emitted.
    assert!(envs.iter().all(|e| e.stanza_id < 0));

    // Persisted: user message + completed assistant whose contents equal
    // the sentence concatenation.
    let user = h.store.find_message("msg_u1").unwrap().unwrap();
    assert_eq!(user.sequence_number, 1);
    let assistant = h.store.find_message(&assistant_id).unwrap().unwrap();
    assert_eq!(assistant.completion_status, CompletionStatus::Completed);
    let concat: String = sentences.iter().map(|(_, _, t, _)| t.as_str()).collect();
    assert_eq!(assistant.contents, concat);
}

#[tokio::test]
async fn s2_disconnect_and_resume_replays_exact_suffix() {
    let h = harness(vec![
        answer("First answer. Done now."),
        answer("Second answer. Also done."),
    ]);
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    h.wait_until(|envs| envs.len() >= 2).await;
    let conv_id = conversation_id_from(&h.published()).unwrap();

    h.send(&user_message(3, &conv_id, "msg_u1", "first?")).await;
    let before = h
        .wait_until(|envs| sentences_of(envs).iter().any(|(_, _, _, f)| *f))
        .await;
    let delivered = before.len();
    let last_seen = before.last().unwrap().stanza_id.unsigned_abs();

    // Transport drops; the next answer is generated into the void.
    h.dispatcher.on_participant_left(ROOM, "client-1").await;
    h.send(&user_message(5, &conv_id, "msg_u2", "second?")).await;

    // Give the detached generation time to finish; nothing new reaches the
    // transport while detached.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.published().len(), delivered);

    // Reconnect and declare the last seen suffix point.
    h.join().await;
    h.send(&configure(7, &conv_id, Some(last_seen))).await;

    let envs = h
        .wait_until(|envs| {
            sentences_of(envs)
                .iter()
                .filter(|(_, _, _, f)| *f)
                .count()
                >= 2
        })
        .await;
    let replayed = &envs[delivered..];

    // First the ack of the declared watermark.
    match &replayed[0].body {
        Body::Acknowledgement(a) => {
            assert_eq!(a.acknowledged_stanza_id, last_seen as i32)
        }
        other => panic!("expected resume ack, got {other:?}"),
    }

    // Then the missed suffix verbatim: contiguous ids, no gap error, and
    // nothing newer than what was emitted while detached (P4: replay
    // introduces no new stanza ids).
    let suffix: Vec<i32> = replayed[1..].iter().map(|e| e.stanza_id).collect();
    let expected: Vec<i32> = (1..=suffix.len() as i32)
        .map(|i| -(last_seen as i32) - i)
        .collect();
    assert_eq!(suffix, expected);
    assert!(!replayed
        .iter()
        .any(|e| matches!(&e.body, Body::Error(err) if err.error_code == "replay-gap")));
}

#[tokio::test]
async fn s3_control_stop_interrupts_generation() {
    let h = harness(vec![Script {
        events: vec![LlmEvent::Token {
            text: "One is done. Two is done. Trailing".to_string(),
        }],
        park: true,
    }]);
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    h.wait_until(|envs| envs.len() >= 2).await;
    let conv_id = conversation_id_from(&h.published()).unwrap();

    h.send(&user_message(3, &conv_id, "msg_u1", "go")).await;
    // Wait for the first sentence (the second is held back mid-stream).
    let envs = h.wait_until(|envs| !sentences_of(envs).is_empty()).await;
    let assistant_id = envs
        .iter()
        .find_map(|e| match &e.body {
            Body::StartAnswer(s) => Some(s.id.clone()),
            _ => None,
        })
        .unwrap();
    let sentences_before = sentences_of(&envs).len();

    h.send(&Envelope::new(7, &conv_id, Body::ControlStop)).await;
    let envs = h
        .wait_until(|envs| {
            envs.iter().any(
                |e| matches!(&e.body, Body::Acknowledgement(a) if a.acknowledged_stanza_id == 7),
            )
        })
        .await;
    let ack_pos = envs
        .iter()
        .position(
            |e| matches!(&e.body, Body::Acknowledgement(a) if a.acknowledged_stanza_id == 7),
        )
        .unwrap();

    // Let the cancelled generator fully drain, then verify silence.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let envs = h.published();
    assert!(
        !envs[ack_pos + 1..]
            .iter()
            .any(|e| matches!(&e.body, Body::AssistantSentence(_))),
        "no sentences after the stop was acknowledged"
    );
    assert_eq!(sentences_of(&envs).len(), sentences_before);

    let assistant = h.store.find_message(&assistant_id).unwrap().unwrap();
    assert_eq!(assistant.completion_status, CompletionStatus::Failed);
    assert_eq!(assistant.contents, "One is done. ");
}

#[tokio::test]
async fn s4_tool_call_round_trip() {
    let rounds = vec![
        Script {
            events: vec![
                LlmEvent::ToolCall {
                    id: "toolu_1".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({"city": "Tokyo"}),
                },
                LlmEvent::Done {
                    stop_reason: "tool_use".to_string(),
                    tokens_in: 4,
                    tokens_out: 4,
                },
            ],
            park: false,
        },
        answer("It is 22 degrees and sunny in Tokyo."),
    ];
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(Weather));
    let h = harness_with(rounds, tools, 256);
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    h.wait_until(|envs| envs.len() >= 2).await;
    let conv_id = conversation_id_from(&h.published()).unwrap();

    h.send(&user_message(3, &conv_id, "msg_u1", "What's the weather in Tokyo?"))
        .await;
    let envs = h
        .wait_until(|envs| sentences_of(envs).iter().any(|(_, _, _, f)| *f))
        .await;

    let request = envs
        .iter()
        .find_map(|e| match &e.body {
            Body::ToolUseRequest(r) => Some(r.clone()),
            _ => None,
        })
        .expect("tool use request envelope");
    assert!(request.id.starts_with("tu_"));
    assert_eq!(request.tool_name, "get_weather");
    assert_eq!(request.arguments["city"], "Tokyo");

    let result = envs
        .iter()
        .find_map(|e| match &e.body {
            Body::ToolUseResult(r) => Some(r.clone()),
            _ => None,
        })
        .expect("tool use result envelope");
    assert_eq!(result.request_id, request.id);
    assert!(result.success);
    assert_eq!(result.result.as_ref().unwrap()["temperatureC"], 22);

    // Request precedes result precedes the spoken answer.
    let req_pos = envs
        .iter()
        .position(|e| matches!(&e.body, Body::ToolUseRequest(_)))
        .unwrap();
    let res_pos = envs
        .iter()
        .position(|e| matches!(&e.body, Body::ToolUseResult(_)))
        .unwrap();
    let sentence_pos = envs
        .iter()
        .position(|e| matches!(&e.body, Body::AssistantSentence(_)))
        .unwrap();
    assert!(req_pos < res_pos && res_pos < sentence_pos);

    // Persisted tool row reached `success`.
    let assistant_id = envs
        .iter()
        .find_map(|e| match &e.body {
            Body::StartAnswer(s) => Some(s.id.clone()),
            _ => None,
        })
        .unwrap();
    let uses = h.store.tool_uses_for(&assistant_id).unwrap();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].status, ToolStatus::Success);
    assert_eq!(uses[0].result.as_ref().unwrap()["condition"], "sunny");
}

#[tokio::test]
async fn s5_replay_floor_exceeded_flags_gap() {
    // Tiny replay buffer so eviction happens quickly.
    let h = harness_with(
        vec![
            answer("Answer one. More of it."),
            answer("Answer two. More again."),
        ],
        ToolRegistry::new(),
        4,
    );
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    h.wait_until(|envs| envs.len() >= 2).await;
    let conv_id = conversation_id_from(&h.published()).unwrap();

    h.send(&user_message(3, &conv_id, "msg_u1", "one")).await;
    h.wait_until(|envs| sentences_of(envs).iter().any(|(_, _, _, f)| *f))
        .await;
    h.send(&user_message(5, &conv_id, "msg_u2", "two")).await;
    let before = h
        .wait_until(|envs| {
            sentences_of(envs).iter().filter(|(_, _, _, f)| *f).count() >= 2
        })
        .await;
    let delivered = before.len();
    assert!(delivered > 4, "enough emissions to evict the oldest");

    // Client reconnects claiming a point older than the replay floor.
    h.send(&configure(7, &conv_id, Some(1))).await;
    let envs = h
        .wait_until(|envs| {
            envs.iter()
                .any(|e| matches!(&e.body, Body::Error(err) if err.error_code == "replay-gap"))
        })
        .await;
    let after = &envs[delivered..];

    match &after[0].body {
        Body::Acknowledgement(a) => assert_eq!(a.acknowledged_stanza_id, 1),
        other => panic!("expected resume ack, got {other:?}"),
    }
    let gap = after
        .iter()
        .find_map(|e| match &e.body {
            Body::Error(err) if err.error_code == "replay-gap" => Some(err.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(gap.severity, Severity::Warning);

    // Everything still resident was retransmitted, oldest first.
    let replayed: Vec<i32> = after
        .iter()
        .skip_while(|e| !matches!(&e.body, Body::Error(err) if err.error_code == "replay-gap"))
        .skip(1)
        .map(|e| e.stanza_id)
        .collect();
    assert_eq!(replayed.len(), 4);
    assert!(replayed.windows(2).all(|w| w[1] == w[0] - 1));
}

#[tokio::test]
async fn s6_duplicate_stanza_acked_without_reprocessing() {
    let h = harness(vec![answer("Only answer. The end.")]);
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    h.wait_until(|envs| envs.len() >= 2).await;
    let conv_id = conversation_id_from(&h.published()).unwrap();

    let msg = user_message(5, &conv_id, "msg_u1", "hello");
    h.send(&msg).await;
    let envs = h
        .wait_until(|envs| sentences_of(envs).iter().any(|(_, _, _, f)| *f))
        .await;
    let delivered = envs.len();
    let start_answers = envs
        .iter()
        .filter(|e| matches!(&e.body, Body::StartAnswer(_)))
        .count();
    assert_eq!(start_answers, 1);

    // Retransmit the same stanza: one more ack, no second generation.
    h.send(&msg).await;
    let envs = h.wait_until(|envs| envs.len() > delivered).await;
    match &envs[delivered].body {
        Body::Acknowledgement(a) => assert_eq!(a.acknowledged_stanza_id, 5),
        other => panic!("expected duplicate ack, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let envs = h.published();
    assert_eq!(
        envs.iter()
            .filter(|e| matches!(&e.body, Body::StartAnswer(_)))
            .count(),
        1,
        "no second answer for a retransmitted user message"
    );
    assert_eq!(h.store.messages_since(&conv_id, 0).unwrap().len(), 2);
}

#[tokio::test]
async fn retry_variation_regenerates_answer() {
    let h = harness(vec![
        answer("First try answer. Done."),
        answer("Second try answer. Done again."),
    ]);
    h.join().await;

    h.send(&configure(1, "", Some(0))).await;
    h.wait_until(|envs| envs.len() >= 2).await;
    let conv_id = conversation_id_from(&h.published()).unwrap();

    h.send(&user_message(3, &conv_id, "msg_u1", "question")).await;
    let envs = h
        .wait_until(|envs| sentences_of(envs).iter().any(|(_, _, _, f)| *f))
        .await;
    let first_assistant = envs
        .iter()
        .find_map(|e| match &e.body {
            Body::StartAnswer(s) => Some(s.id.clone()),
            _ => None,
        })
        .unwrap();

    h.send(&Envelope::new(
        5,
        &conv_id,
        Body::ControlVariation(ControlVariationBody {
            target_message_id: first_assistant.clone(),
            mode: VariationMode::Retry,
        }),
    ))
    .await;

    let envs = h
        .wait_until(|envs| {
            envs.iter()
                .filter(|e| matches!(&e.body, Body::StartAnswer(_)))
                .count()
                >= 2
        })
        .await;
    let second_start = envs
        .iter()
        .filter_map(|e| match &e.body {
            Body::StartAnswer(s) => Some(s.clone()),
            _ => None,
        })
        .nth(1)
        .unwrap();
    assert_eq!(second_start.previous_id, "msg_u1");
    assert_ne!(second_start.id, first_assistant);
}
