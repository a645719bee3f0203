use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use parlance_backends::asr::HttpTranscriptionBackend;
use parlance_backends::embedding::HttpEmbeddingBackend;
use parlance_backends::tts::HttpSpeechBackend;
use parlance_backends::{Backends, HttpLanguageBackend, ToolRegistry};
use parlance_core::config::ParlanceConfig;
use parlance_generator::{GeneratorSettings, ResponseGenerator};
use parlance_runtime::{Dispatcher, RuntimeConfig};
use parlance_store::ConversationStore;

use crate::ws::WsRooms;

pub struct AppState {
    pub config: ParlanceConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub rooms: WsRooms,
}

impl AppState {
    pub fn new(config: ParlanceConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            ConversationStore::open(&config.database.path)
                .map_err(|e| anyhow::anyhow!("store open failed: {e}"))?,
        );

        let backends = Backends {
            llm: Arc::new(HttpLanguageBackend::new(
                config.llm.url.clone(),
                config.llm.api_key.clone(),
            )),
            tts: Some(Arc::new(HttpSpeechBackend::new(
                config.tts.url.clone(),
                config.tts.model.clone(),
                config.tts.voice.clone(),
            ))),
            asr: Some(Arc::new(HttpTranscriptionBackend::new(
                config.asr.url.clone(),
                config.asr.model.clone(),
            ))),
            embedding: Some(Arc::new(HttpEmbeddingBackend::new(
                config.embedding.url.clone(),
                config.embedding.model.clone(),
            ))),
            tools: Arc::new(ToolRegistry::new()),
        };

        let settings = GeneratorSettings::new(&config.llm);
        let generator = Arc::new(ResponseGenerator::new(
            backends.clone(),
            Arc::clone(&store),
            settings,
        ));

        let runtime_config = RuntimeConfig::from_config(&config, &backends);
        info!(features = ?runtime_config.features, "runtime configured");
        let dispatcher = Arc::new(Dispatcher::new(runtime_config, store, generator, backends));

        Ok(Self {
            config,
            dispatcher,
            rooms: WsRooms::default(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    let origins = &state.config.server.cors_origins;
    let cors = if origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(tower_http::cors::Any)
    } else {
        let list = origins
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()?;
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::list(list))
    }
    .allow_methods([Method::GET, Method::POST]);

    Ok(Router::new()
        .route("/healthz", get(health))
        .route("/rooms/{room_id}/ws", get(crate::ws::ws_handler))
        .layer(cors)
        .with_state(state))
}

async fn health() -> &'static str {
    "ok"
}
