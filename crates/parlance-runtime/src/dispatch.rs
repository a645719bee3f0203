//! Room → actor dispatch.
//!
//! The registry is the only process-wide structure: a concurrent map from
//! room id to actor handle, locked only for lookup-or-create. Actors spawn
//! lazily — on participant join or on the first Configuration from a room —
//! and unregister themselves at teardown. Actor lifetimes are independent
//! of any single participant.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use parlance_audio::AudioFrame;
use parlance_backends::Backends;
use parlance_generator::ResponseGenerator;
use parlance_protocol::codec;
use parlance_protocol::envelope::Body;
use parlance_store::ConversationStore;

use crate::actor::{ActorEvent, ActorHandle, ConversationActor, RuntimeConfig};
use crate::transport::RoomTransport;

pub struct Dispatcher {
    config: RuntimeConfig,
    store: Arc<ConversationStore>,
    generator: Arc<ResponseGenerator>,
    backends: Backends,
    actors: Arc<DashMap<String, ActorHandle>>,
    /// Transport handle per room, registered at participant join.
    rooms: DashMap<String, Arc<dyn RoomTransport>>,
}

impl Dispatcher {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<ConversationStore>,
        generator: Arc<ResponseGenerator>,
        backends: Backends,
    ) -> Self {
        Self {
            config,
            store,
            generator,
            backends,
            actors: Arc::new(DashMap::new()),
            rooms: DashMap::new(),
        }
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// A participant entered the room: remember the room's transport and
    /// spawn or attach to its actor.
    pub async fn on_participant_joined(
        &self,
        room_id: &str,
        identity: &str,
        transport: Arc<dyn RoomTransport>,
    ) {
        self.rooms.insert(room_id.to_string(), transport);
        let handle = self.lookup_or_spawn(room_id);
        if let Some(handle) = handle {
            let _ = handle
                .send(ActorEvent::ParticipantJoined {
                    identity: identity.to_string(),
                })
                .await;
            let _ = handle.send(ActorEvent::TransportReconnected).await;
        }
    }

    /// A participant left. The actor detaches (idle TTL starts) but is not
    /// torn down — conversations outlive connections.
    pub async fn on_participant_left(&self, room_id: &str, identity: &str) {
        if let Some(handle) = self.actors.get(room_id).map(|h| h.value().clone()) {
            let _ = handle
                .send(ActorEvent::ParticipantLeft {
                    identity: identity.to_string(),
                })
                .await;
            let _ = handle.send(ActorEvent::TransportDisconnected).await;
        }
    }

    /// Decode a data payload and enqueue it on the room's actor inbox.
    /// Malformed frames become an error report for the actor; unknown rooms
    /// only spawn an actor when the frame is a Configuration handshake.
    pub async fn on_data_received(&self, room_id: &str, payload: Bytes) {
        match codec::decode(&payload) {
            Ok(envelope) => {
                let spawn_worthy = matches!(envelope.body, Body::Configuration(_));
                let handle = if spawn_worthy {
                    self.lookup_or_spawn(room_id)
                } else {
                    self.actors.get(room_id).map(|h| h.value().clone())
                };
                match handle {
                    Some(handle) => {
                        let _ = handle.send(ActorEvent::Inbound(envelope)).await;
                    }
                    None => {
                        debug!(room = %room_id, "data for a room with no actor, dropping");
                    }
                }
            }
            Err(e) => {
                warn!(room = %room_id, error = %e, "malformed envelope from client");
                if let Some(handle) = self.actors.get(room_id).map(|h| h.value().clone()) {
                    let _ = handle
                        .send(ActorEvent::InboundMalformed {
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    /// One audio frame from a subscribed microphone track.
    pub async fn on_audio_frame(&self, room_id: &str, frame: AudioFrame) {
        if let Some(handle) = self.actors.get(room_id).map(|h| h.value().clone()) {
            // A full inbox drops the frame; the inbound window would have
            // evicted it anyway to keep latency bounded.
            let _ = handle.try_send(ActorEvent::AudioFrame(frame));
        }
    }

    /// Close every actor (graceful shutdown).
    pub async fn shutdown(&self) {
        let handles: Vec<ActorHandle> = self.actors.iter().map(|h| h.clone()).collect();
        info!(actors = handles.len(), "dispatcher shutting down");
        for handle in handles {
            let _ = handle.send(ActorEvent::Close).await;
        }
        // Actors unregister themselves; wait for the map to drain.
        for _ in 0..50 {
            if self.actors.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Exactly one actor per room: the dashmap entry is the lock, held only
    /// for lookup-or-create.
    fn lookup_or_spawn(&self, room_id: &str) -> Option<ActorHandle> {
        if let Some(handle) = self.actors.get(room_id) {
            return Some(handle.clone());
        }
        let transport = self.rooms.get(room_id).map(|t| t.value().clone())?;
        use dashmap::mapref::entry::Entry;
        let handle = match self.actors.entry(room_id.to_string()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let handle = ConversationActor::spawn(
                    room_id.to_string(),
                    self.config.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.generator),
                    self.backends.clone(),
                    transport,
                    Arc::clone(&self.actors),
                );
                vacant.insert(handle.clone());
                handle
            }
        };
        Some(handle)
    }
}
