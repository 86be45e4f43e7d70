/// OS-media-bridge side of the bus.
///
/// A publisher task folds every `PlaybackEvent` into one `NowPlaying`
/// snapshot (shared with the socket and HTTP servers through
/// `NowPlayingBoard`) and hands each new revision to every registered
/// `MediaBridge`.  A second task turns failures and song changes into
/// human-readable notifications for connected clients.
use std::sync::Arc;

use hermes_proto::protocol::{NowPlaying, TransportState};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::bus::{PlaybackEvent, Subscription};
use crate::BroadcastMessage;

/// Something that shows "now playing" outside the daemon.
pub trait MediaBridge: Send + Sync {
    fn name(&self) -> &'static str;
    fn publish(&self, now: &NowPlaying);
}

/// Apply one event to a snapshot.  Returns whether anything visible changed.
pub fn fold(now: &mut NowPlaying, event: &PlaybackEvent) -> bool {
    match event {
        PlaybackEvent::StateChanged { new, .. } => {
            now.state = new.clone();
            if !matches!(new, TransportState::Loading) {
                now.buffering = None;
            }
        }
        PlaybackEvent::StationChanged(station) => now.station = station.clone(),
        PlaybackEvent::SongChanged(song) => {
            now.duration_secs = song.as_ref().and_then(|s| s.duration_secs);
            now.song = song.clone();
            now.elapsed_secs = 0.0;
            now.buffering = None;
            now.artwork = None;
            now.has_artwork = false;
        }
        PlaybackEvent::SongRated { song_id, rating } => match now.song.as_mut() {
            Some(song) if &song.id == song_id => song.rating = *rating,
            _ => return false,
        },
        PlaybackEvent::ProgressChanged { elapsed, duration } => {
            now.elapsed_secs = *elapsed;
            now.duration_secs = *duration;
        }
        PlaybackEvent::Buffering(fill) => now.buffering = *fill,
        PlaybackEvent::VolumeChanged(volume) => now.volume = *volume,
        PlaybackEvent::ArtLoaded { song_id, bytes } => {
            if now.song.as_ref().map(|s| &s.id) != Some(song_id) {
                return false;
            }
            now.artwork = Some(Arc::clone(bytes));
            now.has_artwork = true;
        }
        PlaybackEvent::EpisodeFailed(_)
        | PlaybackEvent::AuthExpired { .. }
        | PlaybackEvent::RatingFailed { .. }
        | PlaybackEvent::StreamRetry { .. } => return false,
    }
    true
}

// ── board ─────────────────────────────────────────────────────────────────────

/// Latest snapshot, readable from any task.
#[derive(Clone, Default)]
pub struct NowPlayingBoard {
    inner: Arc<RwLock<NowPlaying>>,
}

impl NowPlayingBoard {
    pub fn new(initial: NowPlaying) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> NowPlaying {
        self.inner.read().await.clone()
    }

    /// Fold `event` in; returns the new revision if it changed anything.
    pub async fn apply(&self, event: &PlaybackEvent) -> Option<NowPlaying> {
        let mut now = self.inner.write().await;
        if !fold(&mut now, event) {
            return None;
        }
        now.rev += 1;
        Some(now.clone())
    }
}

pub fn spawn_publisher(
    mut events: Subscription,
    board: NowPlayingBoard,
    bridges: Vec<Arc<dyn MediaBridge>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(now) = board.apply(&event).await else {
                continue;
            };
            for bridge in &bridges {
                bridge.publish(&now);
            }
        }
        debug!("bridge: publisher exiting");
    })
}

// ── socket bridge ─────────────────────────────────────────────────────────────

/// Pushes every snapshot to connected socket clients.
pub struct SocketBridge {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl SocketBridge {
    pub fn new(tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { tx }
    }
}

impl MediaBridge for SocketBridge {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn publish(&self, now: &NowPlaying) {
        // no receivers is fine
        let _ = self.tx.send(BroadcastMessage::State(now.clone()));
    }
}

// ── notifications ─────────────────────────────────────────────────────────────

/// What a user should be told about `event`, if anything.
pub fn notification(event: &PlaybackEvent) -> Option<BroadcastMessage> {
    let msg = match event {
        PlaybackEvent::SongChanged(Some(song)) => {
            BroadcastMessage::Log(format!("Now playing: {}", song.display_name()))
        }
        PlaybackEvent::EpisodeFailed(episode) => BroadcastMessage::Error(format!(
            "Skipped a song after {} attempts: {}",
            episode.consecutive_failure_count, episode.error
        )),
        PlaybackEvent::AuthExpired { station } => BroadcastMessage::Error(format!(
            "Session expired while playing {}; sign in again",
            station.name
        )),
        PlaybackEvent::RatingFailed { rating, error, .. } => {
            BroadcastMessage::Error(format!("Could not save {:?} rating: {}", rating, error))
        }
        PlaybackEvent::StateChanged {
            new: TransportState::Failed(reason),
            ..
        } => BroadcastMessage::Error(format!("Station stopped: {}", reason)),
        _ => return None,
    };
    Some(msg)
}

pub fn spawn_notifier(
    mut events: Subscription,
    tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(msg) = notification(&event) {
                let _ = tx.send(msg);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, Topic};
    use hermes_proto::error::{FailedEpisode, QueueError, StreamError};
    use hermes_proto::protocol::{Rating, Song, Station};
    use std::sync::Mutex;
    use std::time::Duration;

    fn song(id: &str) -> Song {
        Song {
            id: id.into(),
            title: "Windowlicker".into(),
            artist: "Aphex Twin".into(),
            duration_secs: Some(367.0),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<NowPlaying>>);

    impl MediaBridge for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn publish(&self, now: &NowPlaying) {
            self.0.lock().unwrap().push(now.clone());
        }
    }

    #[test]
    fn test_song_change_resets_progress_and_art() {
        let mut now = NowPlaying {
            elapsed_secs: 99.0,
            artwork: Some(Arc::from(&b"old"[..])),
            has_artwork: true,
            ..Default::default()
        };
        assert!(fold(&mut now, &PlaybackEvent::SongChanged(Some(song("s1")))));
        assert_eq!(now.elapsed_secs, 0.0);
        assert_eq!(now.duration_secs, Some(367.0));
        assert!(now.artwork.is_none());
        assert!(!now.has_artwork);
    }

    #[test]
    fn test_rating_and_art_only_apply_to_current_song() {
        let mut now = NowPlaying::default();
        fold(&mut now, &PlaybackEvent::SongChanged(Some(song("s1"))));

        let other = PlaybackEvent::SongRated {
            song_id: "s2".into(),
            rating: Rating::Liked,
        };
        assert!(!fold(&mut now, &other));
        let late_art = PlaybackEvent::ArtLoaded {
            song_id: "s0".into(),
            bytes: Arc::from(&b"png"[..]),
        };
        assert!(!fold(&mut now, &late_art));

        let ours = PlaybackEvent::SongRated {
            song_id: "s1".into(),
            rating: Rating::Liked,
        };
        assert!(fold(&mut now, &ours));
        assert_eq!(now.song.as_ref().unwrap().rating, Rating::Liked);
    }

    #[test]
    fn test_failures_do_not_touch_the_snapshot() {
        let mut now = NowPlaying::default();
        let event = PlaybackEvent::StreamRetry {
            song_id: "s1".into(),
            attempt: 1,
            error: StreamError::Unreachable("refused".into()),
        };
        assert!(!fold(&mut now, &event));
    }

    #[tokio::test]
    async fn test_board_bumps_rev_on_change_only() {
        let board = NowPlayingBoard::default();
        assert!(board
            .apply(&PlaybackEvent::VolumeChanged(70))
            .await
            .is_some());
        assert!(board
            .apply(&PlaybackEvent::AuthExpired {
                station: Station::default()
            })
            .await
            .is_none());
        let snap = board.snapshot().await;
        assert_eq!(snap.rev, 1);
        assert_eq!(snap.volume, 70);
    }

    #[tokio::test]
    async fn test_publisher_feeds_bridges() {
        let bus = EventBus::new();
        let board = NowPlayingBoard::default();
        let recorder = Arc::new(Recorder::default());
        let handle = spawn_publisher(
            bus.subscribe_all(),
            board.clone(),
            vec![recorder.clone() as Arc<dyn MediaBridge>],
        );

        bus.publish(PlaybackEvent::StateChanged {
            old: TransportState::Idle,
            new: TransportState::Loading,
        });
        bus.publish(PlaybackEvent::SongChanged(Some(song("s1"))));

        tokio::time::timeout(Duration::from_secs(1), async {
            while recorder.0.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen[0].state, TransportState::Loading);
        assert_eq!(seen[1].song.as_ref().unwrap().id, "s1");
        assert_eq!(seen[1].rev, 2);
        assert_eq!(board.snapshot().await.rev, 2);
        assert_eq!(bus.subscriber_count(Topic::Art), 1);
        handle.abort();
    }

    #[test]
    fn test_notifications() {
        let failed = PlaybackEvent::StateChanged {
            old: TransportState::Loading,
            new: TransportState::Failed(QueueError::EmptyStation.into()),
        };
        assert!(matches!(
            notification(&failed),
            Some(BroadcastMessage::Error(m)) if m.contains("no songs")
        ));

        let episode = PlaybackEvent::EpisodeFailed(FailedEpisode {
            station_id: "st".into(),
            song_id: Some("s1".into()),
            consecutive_failure_count: 2,
            failed_songs: 1,
            error: StreamError::DecodeError("bad frame".into()).into(),
        });
        assert!(matches!(
            notification(&episode),
            Some(BroadcastMessage::Error(m)) if m.contains("2 attempts")
        ));

        assert!(matches!(
            notification(&PlaybackEvent::SongChanged(Some(song("s1")))),
            Some(BroadcastMessage::Log(m)) if m == "Now playing: Aphex Twin - Windowlicker"
        ));
        assert!(notification(&PlaybackEvent::VolumeChanged(10)).is_none());
    }
}
