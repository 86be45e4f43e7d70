/// DaemonCore: single-owner event loop around the playback engine.
///
/// All external inputs (socket clients, HTTP API, signals) arrive as
/// `DaemonEvent`s; background completions from the engine's own tasks arrive
/// as `EngineInput`s.  Both are handled here, one at a time, so the engine is
/// never touched from two tasks at once.
///
/// ```text
///   socket / http / ctrl-c ──DaemonEvent──►┐
///                                          ├─► DaemonCore ─► PlaybackEngine
///   fetch / stream / art   ──EngineInput──►┘
/// ```
use hermes_proto::protocol::Command;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::engine::{EngineInput, PlaybackEngine};

// ── DaemonEvent ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// Shutdown requested.
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    engine: PlaybackEngine,
    engine_rx: mpsc::UnboundedReceiver<EngineInput>,
}

impl DaemonCore {
    pub fn new(engine: PlaybackEngine, engine_rx: mpsc::UnboundedReceiver<EngineInput>) -> Self {
        Self { engine, engine_rx }
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.engine.prepare_first();

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("DaemonCore: event channel closed, shutting down");
                        break;
                    }
                    Some(DaemonEvent::Shutdown) => {
                        info!("DaemonCore: shutdown requested");
                        break;
                    }
                    Some(DaemonEvent::ClientCommand(cmd)) => {
                        info!("DaemonCore: command {:?}", cmd);
                        self.handle_command(cmd);
                    }
                },
                Some(input) = self.engine_rx.recv() => {
                    self.engine.handle(input);
                }
            }
        }

        // Save before stopping so resume_on_launch reflects what was playing.
        if let Err(e) = self.engine.save_state() {
            error!("DaemonCore: failed to save state: {}", e);
        }
        self.engine.stop();
        info!("DaemonCore: stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        let engine = &mut self.engine;
        match cmd {
            Command::Remote { command } => engine.on_remote_command(command),
            Command::PlayStation { station } => engine.play_station(station),
            Command::Like => {
                engine.like_current();
            }
            Command::Dislike => {
                engine.dislike_current();
            }
            Command::Tired => {
                engine.tired_of_current();
            }
            Command::VolumeUp => {
                engine.increase_volume();
            }
            Command::VolumeDown => {
                engine.decrease_volume();
            }
            Command::Volume { value } => {
                engine.set_volume(value);
            }
            Command::Screensaver { active } => engine.set_paused_by_screensaver(active),
            Command::ScreenLock { active } => engine.set_paused_by_screen_lock(active),
            Command::SaveState => {
                if let Err(e) = engine.save_state() {
                    error!("DaemonCore: failed to save state: {}", e);
                }
            }
            Command::Reset => engine.reset(),
            // Answered by the socket server from the board.
            Command::GetState => {}
        }
    }
}
