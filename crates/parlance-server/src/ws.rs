//! Local WebSocket room transport.
//!
//! Stands in for the external WebRTC room service during development:
//! each WS connection at `/rooms/{room_id}/ws` is one participant, binary
//! messages carry CBOR envelopes, and server emissions fan out to every
//! connection in the room. Outbound TTS frames are bridged as AudioChunk
//! envelopes with stanza id 0, since a plain WebSocket has no audio track.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use parlance_audio::AudioFrame;
use parlance_protocol::codec;
use parlance_protocol::envelope::{AudioChunkBody, Body, Envelope};
use parlance_runtime::{RoomTransport, TransportError};

use crate::app::AppState;

/// Fan-out buffer per room; slow consumers drop from the tail.
const ROOM_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct WsRooms {
    rooms: DashMap<String, Arc<WsRoom>>,
}

impl WsRooms {
    fn get_or_create(&self, room_id: &str) -> Arc<WsRoom> {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                Arc::new(WsRoom {
                    room_id: room_id.to_string(),
                    tx: broadcast::channel(ROOM_CHANNEL_CAPACITY).0,
                })
            })
            .value()
            .clone()
    }
}

/// One room: a broadcast channel every participant subscribes to.
pub struct WsRoom {
    room_id: String,
    tx: broadcast::Sender<Bytes>,
}

#[async_trait]
impl RoomTransport for WsRoom {
    async fn publish_data(&self, bytes: Bytes, _reliable: bool) -> Result<(), TransportError> {
        // No receivers means nobody is connected; the actor's replay buffer
        // covers them when they come back.
        let _ = self.tx.send(bytes);
        Ok(())
    }

    async fn publish_audio_frame(&self, frame: AudioFrame) -> Result<(), TransportError> {
        let envelope = Envelope::new(
            0,
            self.room_id.clone(),
            Body::AudioChunk(AudioChunkBody {
                format: frame.format.tag(),
                duration_ms: frame.duration_ms(),
                frames: vec![frame.data],
                track_identifier: None,
            }),
        );
        let bytes = codec::encode(&envelope)
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        let _ = self.tx.send(Bytes::from(bytes));
        Ok(())
    }
}

pub async fn ws_handler(
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, room_id, state))
}

/// Per-participant task — lives for the WS session lifetime.
async fn handle_connection(socket: WebSocket, room_id: String, state: Arc<AppState>) {
    let identity = uuid::Uuid::new_v4().to_string();
    info!(room = %room_id, %identity, "participant connected");

    let room = state.rooms.get_or_create(&room_id);
    let mut room_rx = room.tx.subscribe();
    state
        .dispatcher
        .on_participant_joined(&room_id, &identity, room.clone())
        .await;

    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            // client → dispatcher
            inbound = rx.next() => {
                match inbound {
                    Some(Ok(Message::Binary(payload))) => {
                        if payload.len() > parlance_core::config::MAX_ENVELOPE_BYTES {
                            warn!(room = %room_id, size = payload.len(), "envelope too large, closing");
                            break;
                        }
                        state.dispatcher.on_data_received(&room_id, payload).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        debug!(room = %room_id, "ignoring non-binary message");
                    }
                    Some(Err(e)) => {
                        warn!(room = %room_id, error = %e, "websocket error");
                        break;
                    }
                }
            }

            // room broadcast → this participant
            outbound = room_rx.recv() => {
                match outbound {
                    Ok(bytes) => {
                        if tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(room = %room_id, missed, "participant lagging, envelopes skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.dispatcher.on_participant_left(&room_id, &identity).await;
    info!(room = %room_id, %identity, "participant disconnected");
}
