/// EventBus: topic-based fan-out from the engine to its listeners.
///
/// Each subscriber owns an unbounded channel.  Publishing never blocks and
/// never waits on a listener: a slow listener just accumulates a backlog, a
/// dropped one is pruned on the next publish.  Because the engine publishes
/// from a single task, every subscriber observes events in transition order.
///
/// ```text
///   PlaybackEngine ──publish──► EventBus ──► [State]    → bridge, socket, log
///                                        ├─► [Song]     → bridge, notifier
///                                        ├─► [Progress] → bridge
///                                        └─► [Art]      → bridge
/// ```
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hermes_proto::error::{FailedEpisode, QueueError, StreamError};
use hermes_proto::protocol::{Rating, Song, Station, TransportState};
use tokio::sync::mpsc;
use tracing::debug;

// ── events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    State,
    Song,
    Progress,
    Art,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::State, Topic::Song, Topic::Progress, Topic::Art];
}

/// Everything the engine tells the outside world.  Failures ride the same
/// topics as normal changes; listeners tell them apart by variant.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChanged {
        old: TransportState,
        new: TransportState,
    },
    /// A song was given up on after its retries.
    EpisodeFailed(FailedEpisode),
    /// The service or the stream rejected our credentials.  Someone outside
    /// the engine has to re-authenticate.
    AuthExpired {
        station: Station,
    },
    RatingFailed {
        song_id: String,
        rating: Rating,
        error: QueueError,
    },
    VolumeChanged(u8),
    StationChanged(Option<Station>),
    SongChanged(Option<Song>),
    SongRated {
        song_id: String,
        rating: Rating,
    },
    ProgressChanged {
        elapsed: f64,
        duration: Option<f64>,
    },
    Buffering(Option<f32>),
    /// A stream attempt failed and will be retried.
    StreamRetry {
        song_id: String,
        attempt: u32,
        error: StreamError,
    },
    ArtLoaded {
        song_id: String,
        bytes: Arc<[u8]>,
    },
}

impl PlaybackEvent {
    pub fn topic(&self) -> Topic {
        match self {
            PlaybackEvent::StateChanged { .. }
            | PlaybackEvent::EpisodeFailed(_)
            | PlaybackEvent::AuthExpired { .. }
            | PlaybackEvent::RatingFailed { .. }
            | PlaybackEvent::VolumeChanged(_)
            | PlaybackEvent::StreamRetry { .. } => Topic::State,
            PlaybackEvent::StationChanged(_)
            | PlaybackEvent::SongChanged(_)
            | PlaybackEvent::SongRated { .. } => Topic::Song,
            PlaybackEvent::ProgressChanged { .. } | PlaybackEvent::Buffering(_) => {
                Topic::Progress
            }
            PlaybackEvent::ArtLoaded { .. } => Topic::Art,
        }
    }
}

// ── bus ───────────────────────────────────────────────────────────────────────

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<PlaybackEvent>,
}

/// Cheaply cloneable handle; all clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<Topic, Vec<Subscriber>>>>,
}

/// Receiving end of a subscription.  Dropping it unsubscribes.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<PlaybackEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PlaybackEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything delivered so far, in order.
    pub fn drain(&mut self) -> Vec<PlaybackEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = self.rx.try_recv() {
            out.push(evt);
        }
        out
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given topics.  One channel receives all of them, in
    /// publish order.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.lock();
        for topic in topics {
            let subs = table.entry(*topic).or_default();
            if !subs.iter().any(|s| s.id == id) {
                subs.push(Subscriber { id, tx: tx.clone() });
            }
        }
        Subscription { id, rx }
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&Topic::ALL)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut table = self.lock();
        for subs in table.values_mut() {
            subs.retain(|s| s.id != id);
        }
    }

    /// Deliver to every subscriber of the event's topic.  Fire-and-forget.
    pub fn publish(&self, event: PlaybackEvent) {
        let topic = event.topic();
        let mut table = self.lock();
        let Some(subs) = table.get_mut(&topic) else {
            return;
        };
        subs.retain(|s| {
            let alive = s.tx.send(event.clone()).is_ok();
            if !alive {
                debug!("bus: pruning closed subscriber {} on {:?}", s.id, topic);
            }
            alive
        });
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock().get(&topic).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, Vec<Subscriber>>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
