use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::FailureReason;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client (remote control, UI) to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Media-key style transport command.
    Remote { command: RemoteCommand },
    PlayStation { station: Station },
    Like,
    Dislike,
    Tired,
    VolumeUp,
    VolumeDown,
    Volume { value: u8 },
    Screensaver { active: bool },
    ScreenLock { active: bool },
    SaveState,
    /// Stop and forget the remembered station.
    Reset,
    GetState,
}

/// Transport commands an OS media bridge can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteCommand {
    Play,
    Pause,
    Stop,
    Next,
    TogglePlayPause,
    Like,
    Dislike,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full snapshot.
    Hello {
        protocol_version: u32,
        state: NowPlaying,
    },
    State {
        data: NowPlaying,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

// ── data model ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    pub id: String,
    pub name: String,
    /// Artwork shown for the station itself (not per song)
    #[serde(default)]
    pub art_url: Option<String>,
    /// What the station was seeded from ("Artist: Boards of Canada", ...)
    #[serde(default)]
    pub seed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Rating {
    #[default]
    Unrated,
    Liked,
    Disliked,
    Tired,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Song {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub art_url: Option<String>,
    pub stream_url: String,
    #[serde(default)]
    pub rating: Rating,
    /// Seconds; unknown until the stream reports it.
    #[serde(default)]
    pub duration_secs: Option<f64>,
    /// Station whose playlist this song came from.  Filled in when queued.
    #[serde(default)]
    pub station_id: String,
}

impl Song {
    /// "Artist - Title", the way notifications and logs show a song.
    pub fn display_name(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

/// Engine-wide transport state.
///
/// Transitions:
///   Idle -> Loading -> Playing <-> Paused
///   Playing -> Ended -> Loading            (song finished, advancing)
///   Loading | Playing -> Failed -> Idle    (station gave up)
///   any -> Idle                            (stop)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportState {
    /// No station selected / explicitly stopped.
    #[default]
    Idle,
    /// Queue fetch and/or stream open in flight.
    Loading,
    Playing,
    Paused,
    /// The stream finished; the engine is about to advance.
    Ended,
    /// The station was abandoned.  Reported once, then `Idle`.
    Failed(FailureReason),
}

impl TransportState {
    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            TransportState::Idle => "idle",
            TransportState::Loading => "loading",
            TransportState::Playing => "playing",
            TransportState::Paused => "paused",
            TransportState::Ended => "ended",
            TransportState::Failed(_) => "failed",
        }
    }

    /// True while the user expects sound (or sound to start shortly).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransportState::Loading | TransportState::Playing | TransportState::Ended
        )
    }
}

/// What an OS media bridge (and any remote client) is told about playback.
///
/// `rev` is a monotonically increasing counter bumped every time the snapshot
/// changes.  Clients can use it to detect missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NowPlaying {
    #[serde(default)]
    pub rev: u64,
    pub state: TransportState,
    pub station: Option<Station>,
    pub song: Option<Song>,
    pub elapsed_secs: f64,
    pub duration_secs: Option<f64>,
    /// Buffer fill in 0.0..=1.0 while loading, `None` when unknown.
    #[serde(default)]
    pub buffering: Option<f32>,
    pub volume: u8,
    /// Artwork bytes for the current song.  Not sent over the wire; clients
    /// fetch it from the HTTP API.
    #[serde(skip)]
    pub artwork: Option<Arc<[u8]>>,
    #[serde(default)]
    pub has_artwork: bool,
}

/// Largest frame body a peer may announce.  Longer headers are treated as a
/// broken stream, not buffered.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// One step of reading frames out of a receive buffer.
#[derive(Debug)]
pub enum Frame {
    /// Not enough bytes yet for a whole frame.
    Partial,
    /// A whole frame of `consumed` bytes.  Its body may still fail to parse;
    /// the frame is skipped either way.
    Complete {
        message: anyhow::Result<Message>,
        consumed: usize,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        match Self::next_frame(data)? {
            Frame::Partial => anyhow::bail!("Insufficient data for message"),
            Frame::Complete { message, consumed } => Ok((message?, consumed)),
        }
    }

    /// Split the next frame off `data`.  Fails only when the length header
    /// is over `MAX_FRAME_LEN`; after that the stream cannot be resynced.
    pub fn next_frame(data: &[u8]) -> anyhow::Result<Frame> {
        if data.len() < 4 {
            return Ok(Frame::Partial);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
        }
        if data.len() < 4 + len {
            return Ok(Frame::Partial);
        }
        let message = serde_json::from_slice(&data[4..4 + len]).map_err(anyhow::Error::from);
        Ok(Frame::Complete {
            message,
            consumed: 4 + len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    #[test]
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::Remote {
            command: RemoteCommand::TogglePlayPause,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Remote { command }) => {
                assert_eq!(command, RemoteCommand::TogglePlayPause)
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Like).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_bad_frame_is_skipped_whole() {
        let body = b"not json";
        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(body);
        data.extend(Message::Command(Command::Like).encode().unwrap());

        let consumed = match Message::next_frame(&data).unwrap() {
            Frame::Complete { message, consumed } => {
                assert!(message.is_err());
                consumed
            }
            Frame::Partial => panic!("expected a complete frame"),
        };
        assert_eq!(consumed, 4 + body.len());
        let (next, _) = Message::decode(&data[consumed..]).unwrap();
        assert!(matches!(next, Message::Command(Command::Like)));
    }

    #[test]
    fn test_oversized_header_is_an_error() {
        let data = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(Message::next_frame(&data).is_err());
        assert!(Message::decode(&data).is_err());
        // exactly at the limit is just waiting for more bytes
        let data = (MAX_FRAME_LEN as u32).to_be_bytes();
        assert!(matches!(Message::next_frame(&data).unwrap(), Frame::Partial));
    }

    #[test]
    fn test_hello_carries_failed_state() {
        let state = NowPlaying {
            rev: 42,
            state: TransportState::Failed(QueueError::EmptyStation.into()),
            artwork: Some(Arc::from(&b"png"[..])),
            has_artwork: true,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.rev, 42);
                assert_eq!(
                    state.state,
                    TransportState::Failed(QueueError::EmptyStation.into())
                );
                // artwork bytes stay local
                assert!(state.artwork.is_none());
                assert!(state.has_artwork);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_song_display_name() {
        let mut song = Song {
            title: "Roygbiv".into(),
            artist: "Boards of Canada".into(),
            ..Default::default()
        };
        assert_eq!(song.display_name(), "Boards of Canada - Roygbiv");
        song.artist.clear();
        assert_eq!(song.display_name(), "Roygbiv");
    }
}
