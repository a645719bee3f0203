//! CBOR codec for envelopes.
//!
//! The wire unit is a single self-describing CBOR map:
//! `{ "stanzaId": i32, "conversationId": text, "type": u16,
//!    "meta": {text: text}, "body": map }`.
//! `meta` is omitted when empty. `decode(encode(x)) == x` for every valid
//! envelope, including reserved type codes, whose bodies are preserved
//! verbatim as [`Body::Unknown`].

use std::collections::BTreeMap;

use ciborium::Value as CborValue;
use serde::{Deserialize, Serialize};

use crate::envelope::{codes, Body, Envelope};
use crate::error::{CodecError, Result};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    stanza_id: i32,
    conversation_id: String,
    #[serde(rename = "type")]
    type_code: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, String>,
    body: CborValue,
}

/// Encode an envelope into its CBOR wire bytes.
pub fn encode(env: &Envelope) -> Result<Vec<u8>> {
    let wire = WireEnvelope {
        stanza_id: env.stanza_id,
        conversation_id: env.conversation_id.clone(),
        type_code: env.body.type_code(),
        meta: env.meta.clone(),
        body: body_to_value(&env.body)?,
    };

    let mut buf = Vec::new();
    ciborium::into_writer(&wire, &mut buf)
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(buf)
}

/// Decode CBOR wire bytes into an envelope.
///
/// Fails with [`CodecError::Malformed`] when the frame is not a CBOR map
/// with the required fields (or `stanzaId`/`type` exceed their widths), and
/// with [`CodecError::InvalidBody`] when the body does not match the shape
/// declared by a recognised type code. Unrecognised codes succeed and yield
/// [`Body::Unknown`].
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope =
        ciborium::from_reader(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let body = body_from_value(wire.type_code, wire.body)?;

    Ok(Envelope {
        stanza_id: wire.stanza_id,
        conversation_id: wire.conversation_id,
        meta: wire.meta,
        body,
    })
}

fn body_to_value(body: &Body) -> Result<CborValue> {
    let invalid = |e: ciborium::value::Error| CodecError::InvalidBody {
        type_code: body.type_code(),
        reason: e.to_string(),
    };
    match body {
        Body::Error(b) => CborValue::serialized(b).map_err(invalid),
        Body::UserMessage(b) => CborValue::serialized(b).map_err(invalid),
        Body::AssistantMessage(b) => CborValue::serialized(b).map_err(invalid),
        Body::AudioChunk(b) => CborValue::serialized(b).map_err(invalid),
        Body::ReasoningStep(b) => CborValue::serialized(b).map_err(invalid),
        Body::ToolUseRequest(b) => CborValue::serialized(b).map_err(invalid),
        Body::ToolUseResult(b) => CborValue::serialized(b).map_err(invalid),
        Body::Acknowledgement(b) => CborValue::serialized(b).map_err(invalid),
        Body::Transcription(b) => CborValue::serialized(b).map_err(invalid),
        Body::ControlStop => Ok(CborValue::Map(Vec::new())),
        Body::ControlVariation(b) => CborValue::serialized(b).map_err(invalid),
        Body::Configuration(b) => CborValue::serialized(b).map_err(invalid),
        Body::StartAnswer(b) => CborValue::serialized(b).map_err(invalid),
        Body::MemoryTrace(b) => CborValue::serialized(b).map_err(invalid),
        Body::Commentary(b) => CborValue::serialized(b).map_err(invalid),
        Body::AssistantSentence(b) => CborValue::serialized(b).map_err(invalid),
        Body::Unknown { value, .. } => Ok(value.clone()),
    }
}

fn body_from_value(type_code: u16, value: CborValue) -> Result<Body> {
    fn typed<T: for<'de> Deserialize<'de>>(type_code: u16, value: CborValue) -> Result<T> {
        value.deserialized().map_err(|e: ciborium::value::Error| {
            CodecError::InvalidBody {
                type_code,
                reason: e.to_string(),
            }
        })
    }

    let body = match type_code {
        codes::ERROR => Body::Error(typed(type_code, value)?),
        codes::USER_MESSAGE => Body::UserMessage(typed(type_code, value)?),
        codes::ASSISTANT_MESSAGE => Body::AssistantMessage(typed(type_code, value)?),
        codes::AUDIO_CHUNK => Body::AudioChunk(typed(type_code, value)?),
        codes::REASONING_STEP => Body::ReasoningStep(typed(type_code, value)?),
        codes::TOOL_USE_REQUEST => Body::ToolUseRequest(typed(type_code, value)?),
        codes::TOOL_USE_RESULT => Body::ToolUseResult(typed(type_code, value)?),
        codes::ACKNOWLEDGEMENT => Body::Acknowledgement(typed(type_code, value)?),
        codes::TRANSCRIPTION => Body::Transcription(typed(type_code, value)?),
        codes::CONTROL_STOP => {
            if !matches!(value, CborValue::Map(_) | CborValue::Null) {
                return Err(CodecError::InvalidBody {
                    type_code,
                    reason: "expected empty map".to_string(),
                });
            }
            Body::ControlStop
        }
        codes::CONTROL_VARIATION => Body::ControlVariation(typed(type_code, value)?),
        codes::CONFIGURATION => Body::Configuration(typed(type_code, value)?),
        codes::START_ANSWER => Body::StartAnswer(typed(type_code, value)?),
        codes::MEMORY_TRACE => Body::MemoryTrace(typed(type_code, value)?),
        codes::COMMENTARY => Body::Commentary(typed(type_code, value)?),
        codes::ASSISTANT_SENTENCE => Body::AssistantSentence(typed(type_code, value)?),
        other => Body::Unknown {
            type_code: other,
            value,
        },
    };
    Ok(body)
}
