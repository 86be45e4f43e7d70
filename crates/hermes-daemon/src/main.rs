mod bridge;
mod bus;
mod core;
mod engine;
mod http;
mod mpv;
mod queue;
mod service;
mod socket;
mod stream;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use hermes_proto::config::Config;
use hermes_proto::protocol::NowPlaying;
use hermes_proto::state::JsonFileStore;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bridge::{MediaBridge, NowPlayingBoard, SocketBridge};
use crate::bus::{EventBus, Topic};

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// A new now-playing revision.
    State(NowPlaying),
    Log(String),
    /// Something the user should see (failed station, expired session...).
    Error(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is OK
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = hermes_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hermes_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let store = JsonFileStore::open(config.daemon.state_file.clone());
    info!("State file: {:?}", store.path());

    let service = Arc::new(service::HttpStationService::new(&config.service)?);
    let initial_volume = hermes_proto::state::PersistentState::load(&store).volume;
    let audio = Arc::new(mpv::MpvBackend::spawn(initial_volume));

    let bus = EventBus::new();
    // Subscribe before the engine exists so nothing it publishes is missed.
    let publisher_sub = bus.subscribe_all();
    let notifier_sub = bus.subscribe(&[Topic::State, Topic::Song]);

    let (engine, engine_rx) = engine::PlaybackEngine::new(
        config.playback.clone(),
        service,
        audio,
        Box::new(store),
        bus.clone(),
    );

    let board = NowPlayingBoard::new(engine.now_playing());
    let bridges: Vec<Arc<dyn MediaBridge>> = vec![Arc::new(SocketBridge::new(broadcast_tx.clone()))];
    for bridge in &bridges {
        info!("Media bridge: {}", bridge.name());
    }
    let _publisher = bridge::spawn_publisher(publisher_sub, board.clone(), bridges);
    let _notifier = bridge::spawn_notifier(notifier_sub, broadcast_tx.clone());

    // Event channel: all external inputs funnel into DaemonCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::DaemonEvent>(256);

    let _socket_handle = socket::start_server(
        config.daemon.bind_address.clone(),
        hermes_proto::platform::DAEMON_TCP_PORT,
        board.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            board.clone(),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        let _ = shutdown_tx.send(core::DaemonEvent::Shutdown).await;
    });

    info!("Daemon initialised, running event loop");
    core::DaemonCore::new(engine, engine_rx).run(event_rx).await?;

    Ok(())
}
