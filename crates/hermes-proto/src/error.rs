//! Failure taxonomy shared by the engine, its collaborators and the wire.
//!
//! None of these are "errors" in the plumbing sense: every one of them ends
//! up as a payload on the event bus so listeners can react to it.  Plumbing
//! (config, sockets, files) keeps using `anyhow`.

use serde::{Deserialize, Serialize};

/// Why an audio stream could not be played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail")]
pub enum StreamError {
    /// Connection refused, DNS failure, open timeout, player unavailable.
    #[error("stream unreachable: {0}")]
    Unreachable(String),
    /// Bytes arrived but could not be decoded as audio.
    #[error("stream decode error: {0}")]
    DecodeError(String),
    /// The backend rejected the stream URL's credentials.
    #[error("stream authorisation expired")]
    AuthExpired,
}

/// Why the song queue could not be replenished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail")]
pub enum QueueError {
    /// Transport failure or timeout talking to the station service.
    #[error("station service unreachable: {0}")]
    NetworkError(String),
    /// The service answered but had no songs for the station.
    #[error("station returned no songs")]
    EmptyStation,
    /// The service rejected our session.
    #[error("station service authorisation expired")]
    AuthExpired,
}

/// Reason attached to `TransportState::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "source", content = "error")]
pub enum FailureReason {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl FailureReason {
    /// True when re-authentication (not a retry) is the way out.
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            FailureReason::Stream(StreamError::AuthExpired)
                | FailureReason::Queue(QueueError::AuthExpired)
        )
    }
}

/// One song that could not be played after its retries were exhausted.
///
/// `consecutive_failure_count` counts stream attempts for that song;
/// `failed_songs` counts songs in a row that ended this way for the station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEpisode {
    pub station_id: String,
    pub song_id: Option<String>,
    pub consecutive_failure_count: u32,
    pub failed_songs: u32,
    pub error: FailureReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_expired_detection() {
        assert!(FailureReason::from(StreamError::AuthExpired).is_auth_expired());
        assert!(FailureReason::from(QueueError::AuthExpired).is_auth_expired());
        assert!(!FailureReason::from(QueueError::EmptyStation).is_auth_expired());
        assert!(!FailureReason::from(StreamError::Unreachable("dns".into())).is_auth_expired());
    }

    #[test]
    fn test_display_is_transparent() {
        let reason = FailureReason::from(StreamError::DecodeError("bad frame".into()));
        assert_eq!(reason.to_string(), "stream decode error: bad frame");
    }
}
