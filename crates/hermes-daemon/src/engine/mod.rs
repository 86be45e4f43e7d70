/// PlaybackEngine: the playback state machine.
///
/// Owned by exactly one task (`DaemonCore`).  Commands are plain method
/// calls; everything asynchronous (batch fetches, rating submissions, art,
/// stream events) comes back as an `EngineInput` on the channel returned by
/// `PlaybackEngine::new`, and is fed in through `handle()`.
///
/// ```text
///   Idle ──play_station──► Loading ──Opened──► Playing ◄──► Paused
///                            ▲                    │
///                            └──── Ended ◄─Finished┘
///   Loading | Playing ──(too many failures)──► Failed ──► Idle
/// ```
///
/// Every outstanding operation carries an `OpToken`.  Switching stations,
/// `stop()` and station failure cancel all tokens, so late completions from
/// abandoned work are dropped instead of corrupting the new state.
mod ops;

use std::sync::Arc;

use hermes_proto::config::PlaybackConfig;
use hermes_proto::error::{FailedEpisode, FailureReason, QueueError, StreamError};
use hermes_proto::protocol::{NowPlaying, Rating, RemoteCommand, Song, Station, TransportState};
use hermes_proto::state::{
    InterruptionPrefs, KeyValueStore, KeyValueStoreExt, PersistentState, LAST_STATION_KEY,
    PLAY_AUTOMATICALLY_ON_LAUNCH, RESUME_ON_LAUNCH_KEY, VOLUME_KEY,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, PlaybackEvent};
use crate::queue::SongQueue;
use crate::service::StationService;
use crate::stream::{AudioBackend, AudioStream, StreamEvent, StreamEventKind, StreamEventSink};

pub use ops::{OpKind, OpToken, PendingOps};

// ── EngineInput ───────────────────────────────────────────────────────────────

/// Completions of background work, routed back into the engine.
#[derive(Debug)]
pub enum EngineInput {
    BatchFetched {
        token: OpToken,
        result: Result<Vec<Song>, QueueError>,
    },
    Stream(StreamEvent),
    /// The open deadline for a stream passed.
    OpenTimedOut { token: OpToken },
    /// A background rating submission was rejected.  Not token-checked: the
    /// optimistic rating stays, the failure is only reported.
    RatingFailed {
        song_id: String,
        rating: Rating,
        error: QueueError,
    },
    ArtFetched {
        token: OpToken,
        song_id: String,
        result: Result<Vec<u8>, QueueError>,
    },
}

// ── PlaybackEngine ────────────────────────────────────────────────────────────

pub struct PlaybackEngine {
    config: PlaybackConfig,
    service: Arc<dyn StationService>,
    audio: Arc<dyn AudioBackend>,
    store: Box<dyn KeyValueStore>,
    bus: EventBus,
    tx: mpsc::UnboundedSender<EngineInput>,
    ops: PendingOps,

    state: TransportState,
    /// Station being played right now.  `None` after stop / failure.
    station: Option<Station>,
    /// Station `play()` falls back to.  Survives `stop()`.
    last_station: Option<Station>,
    queue: Option<SongQueue>,
    song: Option<Song>,
    stream: Option<Box<dyn AudioStream>>,
    /// The current stream produced audio at least once.
    stream_opened: bool,
    elapsed: f64,
    duration: Option<f64>,
    volume: u8,
    artwork: Option<Arc<[u8]>>,

    /// Stream attempts at the current song.
    song_attempts: u32,
    /// Songs in a row given up on.
    failed_songs: u32,
    /// Network failures in a row while waiting for a song.
    fetch_failures: u32,

    paused_by_screensaver: bool,
    paused_by_screen_lock: bool,
    /// The current pause was caused by an interruption, not the user.
    interruption_paused: bool,
}

impl PlaybackEngine {
    pub fn new(
        config: PlaybackConfig,
        service: Arc<dyn StationService>,
        audio: Arc<dyn AudioBackend>,
        store: Box<dyn KeyValueStore>,
        bus: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<EngineInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let volume = PersistentState::load(store.as_ref()).volume;
        let engine = Self {
            config,
            service,
            audio,
            store,
            bus,
            tx,
            ops: PendingOps::new(),
            state: TransportState::Idle,
            station: None,
            last_station: None,
            queue: None,
            song: None,
            stream: None,
            stream_opened: false,
            elapsed: 0.0,
            duration: None,
            volume,
            artwork: None,
            song_attempts: 0,
            failed_songs: 0,
            fetch_failures: 0,
            paused_by_screensaver: false,
            paused_by_screen_lock: false,
            interruption_paused: false,
        };
        (engine, rx)
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> &TransportState {
        &self.state
    }

    pub fn station(&self) -> Option<&Station> {
        self.station.as_ref()
    }

    pub fn last_station(&self) -> Option<&Station> {
        self.last_station.as_ref()
    }

    pub fn current_song(&self) -> Option<&Song> {
        self.song.as_ref()
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn artwork(&self) -> Option<Arc<[u8]>> {
        self.artwork.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.as_ref().map_or(0, SongQueue::len)
    }

    pub fn is_interruption_paused(&self) -> bool {
        self.interruption_paused
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Owned snapshot of everything a listener might show.
    pub fn now_playing(&self) -> NowPlaying {
        NowPlaying {
            rev: 0,
            state: self.state.clone(),
            station: self.station.clone(),
            song: self.song.clone(),
            elapsed_secs: self.elapsed,
            duration_secs: self.duration,
            buffering: None,
            volume: self.volume,
            has_artwork: self.artwork.is_some(),
            artwork: self.artwork.clone(),
        }
    }

    // ── startup / shutdown ────────────────────────────────────────────────────

    /// Restore volume and the remembered station; start playing it if the
    /// user asked for that.
    pub fn prepare_first(&mut self) {
        let saved = PersistentState::load(self.store.as_ref());
        self.volume = saved.volume;
        self.bus.publish(PlaybackEvent::VolumeChanged(self.volume));
        let resume = saved.should_resume();
        self.last_station = saved.last_station;

        match (&self.last_station, resume) {
            (Some(station), true) => {
                info!("engine: resuming station {}", station.name);
                let station = station.clone();
                self.play_station(station);
            }
            (Some(station), false) => {
                info!("engine: remembered station {} (not resuming)", station.name)
            }
            (None, _) => debug!("engine: no remembered station"),
        }
    }

    pub fn save_state(&mut self) -> anyhow::Result<()> {
        match &self.last_station {
            Some(station) => self.store.put(LAST_STATION_KEY, station),
            None => self.store.remove(LAST_STATION_KEY),
        }
        self.store.put(VOLUME_KEY, &self.volume);
        let resume = self.state.is_active();
        self.store.put(RESUME_ON_LAUNCH_KEY, &resume);
        self.store.flush()?;
        info!("engine: state saved (resume_on_launch={})", resume);
        Ok(())
    }

    /// Stop and forget the remembered station.
    pub fn reset(&mut self) {
        self.stop();
        self.last_station = None;
        self.store.remove(LAST_STATION_KEY);
        self.persist();
        info!("engine: reset");
    }

    pub fn set_play_on_start(&mut self, play: bool) {
        self.store.put(PLAY_AUTOMATICALLY_ON_LAUNCH, &play);
        self.persist();
    }

    pub fn play_on_start(&self) -> bool {
        self.store.bool_or(PLAY_AUTOMATICALLY_ON_LAUNCH, false)
    }

    // ── transport ─────────────────────────────────────────────────────────────

    pub fn play_station(&mut self, station: Station) {
        let same = self.station.as_ref().is_some_and(|s| s.id == station.id);
        if same && self.state == TransportState::Playing {
            debug!("engine: {} already playing", station.name);
            return;
        }

        info!("engine: switching to station {} ({})", station.name, station.id);
        self.teardown();

        self.queue = Some(SongQueue::new(station.clone(), self.config.low_water_mark));
        self.station = Some(station.clone());
        self.last_station = Some(station.clone());
        self.store.put(LAST_STATION_KEY, &station);
        self.persist();
        self.bus
            .publish(PlaybackEvent::StationChanged(Some(station)));

        self.set_state(TransportState::Loading);
        self.request_fetch();
    }

    /// Returns whether playback is, or is becoming, active.
    pub fn play(&mut self) -> bool {
        self.interruption_paused = false;
        match self.state {
            TransportState::Playing | TransportState::Loading | TransportState::Ended => true,
            TransportState::Paused => self.resume_stream(),
            TransportState::Idle | TransportState::Failed(_) => match self.last_station.clone() {
                Some(station) => {
                    self.play_station(station);
                    true
                }
                None => {
                    debug!("engine: play with nothing to play");
                    false
                }
            },
        }
    }

    /// Returns whether it paused.
    pub fn pause(&mut self) -> bool {
        self.interruption_paused = false;
        self.pause_stream()
    }

    pub fn playpause(&mut self) -> bool {
        if self.state == TransportState::Playing {
            self.pause()
        } else {
            self.play()
        }
    }

    pub fn stop(&mut self) {
        if self.state == TransportState::Idle && self.station.is_none() {
            return;
        }
        info!("engine: stop");
        self.teardown();
        self.set_state(TransportState::Idle);
    }

    /// Skip the current song.  No rating side effect.
    pub fn next(&mut self) {
        if self.queue.is_none() {
            debug!("engine: next with no station");
            return;
        }
        if let Some(song) = &self.song {
            info!("engine: skipping {}", song.display_name());
        }
        self.advance();
    }

    pub fn on_remote_command(&mut self, command: RemoteCommand) {
        debug!("engine: remote {:?}", command);
        match command {
            RemoteCommand::Play => {
                self.play();
            }
            RemoteCommand::Pause => {
                self.pause();
            }
            RemoteCommand::Stop => self.stop(),
            RemoteCommand::Next => self.next(),
            RemoteCommand::TogglePlayPause => {
                self.playpause();
            }
            RemoteCommand::Like => {
                self.like_current();
            }
            RemoteCommand::Dislike => {
                self.dislike_current();
            }
        }
    }

    // ── ratings ───────────────────────────────────────────────────────────────

    /// Rate `song` optimistically.  The service call runs in the background;
    /// if it fails a `RatingFailed` event is published and the local rating
    /// stays as set.
    pub fn rate(&mut self, song: &mut Song, liked: bool) {
        let rating = if liked { Rating::Liked } else { Rating::Disliked };
        song.rating = rating;

        let is_current = match self.song.as_mut() {
            Some(current) if current.id == song.id => {
                current.rating = rating;
                true
            }
            _ => false,
        };
        info!("engine: rated {} {:?}", song.display_name(), rating);
        self.bus.publish(PlaybackEvent::SongRated {
            song_id: song.id.clone(),
            rating,
        });

        let station = self.rating_station(song);
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        let submitted = song.clone();
        tokio::spawn(async move {
            if let Err(error) = service.submit_rating(&station, &submitted, liked).await {
                let _ = tx.send(EngineInput::RatingFailed {
                    song_id: submitted.id,
                    rating,
                    error,
                });
            }
        });

        if !liked && is_current && self.config.skip_on_dislike {
            self.next();
        }
    }

    pub fn like_current(&mut self) -> bool {
        self.rate_current(true)
    }

    pub fn dislike_current(&mut self) -> bool {
        self.rate_current(false)
    }

    fn rate_current(&mut self, liked: bool) -> bool {
        let Some(mut song) = self.song.clone() else {
            return false;
        };
        self.rate(&mut song, liked);
        true
    }

    /// Mark the current song `Tired` and move on.
    pub fn tired_of_current(&mut self) -> bool {
        let Some(song) = self.song.as_mut() else {
            return false;
        };
        song.rating = Rating::Tired;
        let song = song.clone();
        info!("engine: tired of {}", song.display_name());
        self.bus.publish(PlaybackEvent::SongRated {
            song_id: song.id.clone(),
            rating: Rating::Tired,
        });

        let station = self.rating_station(&song);
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(error) = service.submit_tired(&station, &song).await {
                let _ = tx.send(EngineInput::RatingFailed {
                    song_id: song.id,
                    rating: Rating::Tired,
                    error,
                });
            }
        });

        self.next();
        true
    }

    /// The station `song` was queued from.  Songs without one are rated
    /// against the current (or remembered) station.
    fn rating_station(&self, song: &Song) -> Station {
        [self.station.as_ref(), self.last_station.as_ref()]
            .into_iter()
            .flatten()
            .find(|s| song.station_id.is_empty() || s.id == song.station_id)
            .cloned()
            .unwrap_or_else(|| Station {
                id: song.station_id.clone(),
                ..Default::default()
            })
    }

    // ── interruptions ─────────────────────────────────────────────────────────

    pub fn set_paused_by_screensaver(&mut self, active: bool) {
        if self.paused_by_screensaver == active {
            return;
        }
        self.paused_by_screensaver = active;
        let prefs = InterruptionPrefs::load(self.store.as_ref());
        if active {
            if prefs.pause_on_screensaver_start {
                self.interrupt("screensaver");
            }
        } else {
            self.end_interruption("screensaver", prefs.play_on_screensaver_stop);
        }
    }

    pub fn set_paused_by_screen_lock(&mut self, active: bool) {
        if self.paused_by_screen_lock == active {
            return;
        }
        self.paused_by_screen_lock = active;
        let prefs = InterruptionPrefs::load(self.store.as_ref());
        if active {
            if prefs.pause_on_screen_lock {
                self.interrupt("screen lock");
            }
        } else {
            self.end_interruption("screen lock", prefs.play_on_screen_unlock);
        }
    }

    fn interrupt(&mut self, cause: &str) {
        if self.pause_stream() {
            info!("engine: paused by {}", cause);
            self.interruption_paused = true;
        }
    }

    fn end_interruption(&mut self, cause: &str, resume: bool) {
        if self.paused_by_screensaver || self.paused_by_screen_lock {
            return;
        }
        if !std::mem::take(&mut self.interruption_paused) {
            return;
        }
        if resume && self.state == TransportState::Paused {
            info!("engine: {} ended, resuming", cause);
            self.resume_stream();
        }
    }

    // ── volume ────────────────────────────────────────────────────────────────

    pub fn increase_volume(&mut self) -> u8 {
        self.set_volume(self.volume.saturating_add(self.config.volume_step))
    }

    pub fn decrease_volume(&mut self) -> u8 {
        self.set_volume(self.volume.saturating_sub(self.config.volume_step))
    }

    /// Clamped to 0..=100.  Returns the volume now in effect.
    pub fn set_volume(&mut self, volume: u8) -> u8 {
        let volume = volume.min(100);
        if volume == self.volume {
            return volume;
        }
        self.volume = volume;
        if let Some(stream) = self.stream.as_mut() {
            stream.set_volume(volume);
        }
        self.store.put(VOLUME_KEY, &volume);
        self.persist();
        self.bus.publish(PlaybackEvent::VolumeChanged(volume));
        volume
    }

    // ── async completions ─────────────────────────────────────────────────────

    pub fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::BatchFetched { token, result } => self.on_batch(token, result),
            EngineInput::Stream(event) => self.on_stream_event(event),
            EngineInput::OpenTimedOut { token } => {
                if self.ops.is_current(OpKind::Stream, token) && !self.stream_opened {
                    warn!("engine: stream open timed out ({})", token);
                    self.on_stream_failed(StreamError::Unreachable("open timed out".into()));
                }
            }
            EngineInput::RatingFailed {
                song_id,
                rating,
                error,
            } => {
                warn!("engine: rating {:?} for {} failed: {}", rating, song_id, error);
                self.bus.publish(PlaybackEvent::RatingFailed {
                    song_id,
                    rating,
                    error,
                });
            }
            EngineInput::ArtFetched {
                token,
                song_id,
                result,
            } => self.on_art(token, song_id, result),
        }
    }

    fn on_batch(&mut self, token: OpToken, result: Result<Vec<Song>, QueueError>) {
        if !self.ops.accept(OpKind::Fetch, token) {
            debug!("engine: dropping stale batch ({})", token);
            return;
        }
        let waiting = self.waiting_for_song();
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        queue.refill_finished();

        let error = match result {
            Ok(batch) if !batch.is_empty() => {
                let added = queue.extend(batch);
                self.fetch_failures = 0;
                info!("engine: queued {} songs ({} waiting)", added, queue.len());
                if waiting {
                    self.advance();
                }
                return;
            }
            Ok(_) => QueueError::EmptyStation,
            Err(e) => e,
        };

        match error {
            QueueError::AuthExpired => {
                warn!("engine: station service rejected our session");
                self.publish_auth_expired();
                self.fail_station(QueueError::AuthExpired.into());
            }
            QueueError::EmptyStation => {
                queue.extend(Vec::new());
                let empties = queue.empty_batches();
                if !waiting {
                    warn!("engine: background refill came back empty");
                } else if empties >= self.config.empty_refill_limit {
                    self.fail_station(QueueError::EmptyStation.into());
                } else {
                    warn!("engine: empty batch ({}), asking again", empties);
                    self.request_fetch();
                }
            }
            QueueError::NetworkError(msg) => {
                if !waiting {
                    warn!("engine: background refill failed: {}", msg);
                    return;
                }
                self.fetch_failures += 1;
                if self.fetch_failures > self.config.fetch_retries {
                    self.fail_station(QueueError::NetworkError(msg).into());
                } else {
                    warn!("engine: batch fetch failed ({}), retrying", msg);
                    self.request_fetch();
                }
            }
        }
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        if !self.ops.is_current(OpKind::Stream, event.token) {
            debug!("engine: dropping stale stream event ({})", event.token);
            return;
        }
        match event.kind {
            StreamEventKind::Opened => self.mark_opened(),
            StreamEventKind::Buffering(fill) => {
                self.bus.publish(PlaybackEvent::Buffering(fill));
            }
            StreamEventKind::Progress { elapsed, total } => {
                self.mark_opened();
                self.update_progress(elapsed, total);
            }
            StreamEventKind::Finished => {
                if let Some(song) = &self.song {
                    debug!("engine: finished {}", song.display_name());
                }
                self.release_stream();
                self.set_state(TransportState::Ended);
                self.advance();
            }
            StreamEventKind::Failed(error) => self.on_stream_failed(error),
        }
    }

    fn mark_opened(&mut self) {
        if self.stream_opened {
            return;
        }
        self.stream_opened = true;
        self.failed_songs = 0;
        if self.state == TransportState::Loading {
            self.set_state(TransportState::Playing);
        }
    }

    fn update_progress(&mut self, elapsed: f64, total: Option<f64>) {
        let mut changed = false;
        if total.is_some() && total != self.duration {
            self.duration = total;
            changed = true;
        }
        let mut elapsed = elapsed.max(0.0);
        if let Some(duration) = self.duration {
            // The duration can shrink when the player re-estimates it.
            if self.elapsed > duration {
                self.elapsed = duration;
                changed = true;
            }
            elapsed = elapsed.min(duration);
        }
        if elapsed > self.elapsed {
            self.elapsed = elapsed;
            changed = true;
        }
        if changed {
            self.publish_progress();
        }
    }

    fn on_stream_failed(&mut self, error: StreamError) {
        let Some(song) = self.song.clone() else {
            return;
        };

        if error == StreamError::AuthExpired {
            warn!("engine: stream for {} rejected our session", song.display_name());
            self.publish_auth_expired();
            self.fail_station(error.into());
            return;
        }

        if self.state == TransportState::Paused {
            // Reopened by the next play(); the pause stays in effect.
            info!(
                "engine: {} dropped while paused: {}",
                song.display_name(),
                error
            );
            self.release_stream();
            return;
        }

        self.song_attempts += 1;
        if self.song_attempts <= self.config.stream_retries {
            warn!(
                "engine: {} failed (attempt {}): {}, retrying",
                song.display_name(),
                self.song_attempts,
                error
            );
            self.bus.publish(PlaybackEvent::StreamRetry {
                song_id: song.id,
                attempt: self.song_attempts,
                error,
            });
            self.open_stream();
            return;
        }

        self.failed_songs += 1;
        warn!(
            "engine: giving up on {} after {} attempts: {}",
            song.display_name(),
            self.song_attempts,
            error
        );
        let station_id = self
            .station
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default();
        self.bus
            .publish(PlaybackEvent::EpisodeFailed(FailedEpisode {
                station_id,
                song_id: Some(song.id),
                consecutive_failure_count: self.song_attempts,
                failed_songs: self.failed_songs,
                error: error.clone().into(),
            }));

        if self.failed_songs >= self.config.station_failure_limit {
            self.fail_station(error.into());
        } else {
            self.advance();
        }
    }

    fn on_art(&mut self, token: OpToken, song_id: String, result: Result<Vec<u8>, QueueError>) {
        if !self.ops.accept(OpKind::Art, token) {
            debug!("engine: dropping stale artwork ({})", token);
            return;
        }
        if self.song.as_ref().map(|s| s.id.as_str()) != Some(song_id.as_str()) {
            return;
        }
        match result {
            Ok(bytes) if !bytes.is_empty() => {
                let bytes: Arc<[u8]> = Arc::from(bytes);
                debug!("engine: artwork for {} ({} bytes)", song_id, bytes.len());
                self.artwork = Some(Arc::clone(&bytes));
                self.bus.publish(PlaybackEvent::ArtLoaded { song_id, bytes });
            }
            Ok(_) => debug!("engine: empty artwork for {}", song_id),
            Err(e) => warn!("engine: artwork for {} failed: {}", song_id, e),
        }
    }

    // ── internals ─────────────────────────────────────────────────────────────

    fn waiting_for_song(&self) -> bool {
        self.state == TransportState::Loading && self.song.is_none()
    }

    /// Dequeue and start the next song, or wait for one.
    fn advance(&mut self) {
        self.release_stream();
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        let next = queue.dequeue_next();
        if queue.take_refill_request() {
            self.spawn_fetch();
        }
        match next {
            Some(song) => self.start_song(song),
            None => {
                debug!("engine: queue empty, waiting for songs");
                self.set_song(None);
                self.set_state(TransportState::Loading);
                self.request_fetch();
            }
        }
    }

    fn start_song(&mut self, song: Song) {
        info!("engine: now playing {}", song.display_name());
        self.song_attempts = 0;
        self.set_song(Some(song));
        self.request_art();
        self.open_stream();
    }

    fn set_song(&mut self, song: Option<Song>) {
        if song.is_none() && self.song.is_none() {
            return;
        }
        self.elapsed = 0.0;
        self.duration = song.as_ref().and_then(|s| s.duration_secs);
        self.artwork = None;
        self.ops.cancel(OpKind::Art);
        self.song = song.clone();
        self.bus.publish(PlaybackEvent::SongChanged(song));
        self.publish_progress();
    }

    fn open_stream(&mut self) {
        let Some(url) = self.song.as_ref().map(|s| s.stream_url.clone()) else {
            return;
        };
        self.release_stream();
        let token = self.ops.issue(OpKind::Stream);
        debug!("engine: opening {} ({})", url, token);
        let sink = StreamEventSink::new(token, self.tx.clone());
        self.stream = Some(self.audio.open(&url, self.volume, sink));
        self.set_state(TransportState::Loading);

        let tx = self.tx.clone();
        let deadline = self.config.open_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = tx.send(EngineInput::OpenTimedOut { token });
        });
    }

    fn release_stream(&mut self) {
        self.ops.cancel(OpKind::Stream);
        self.stream_opened = false;
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
    }

    fn pause_stream(&mut self) -> bool {
        if self.state != TransportState::Playing {
            return false;
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.pause();
        }
        self.set_state(TransportState::Paused);
        true
    }

    fn resume_stream(&mut self) -> bool {
        if self.state != TransportState::Paused {
            return false;
        }
        match self.stream.as_mut() {
            Some(stream) => {
                stream.resume();
                self.set_state(TransportState::Playing);
            }
            None => self.open_stream(),
        }
        true
    }

    /// Forced fetch; does nothing while one is already running.
    fn request_fetch(&mut self) {
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        if queue.begin_refill() {
            self.spawn_fetch();
        }
    }

    fn spawn_fetch(&mut self) {
        let Some(station) = self.queue.as_ref().map(|q| q.station().clone()) else {
            return;
        };
        let token = self.ops.issue(OpKind::Fetch);
        debug!("engine: fetching batch for {} ({})", station.id, token);
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        let timeout = self.config.fetch_timeout();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, service.fetch_batch(&station)).await
            {
                Ok(result) => result,
                Err(_) => Err(QueueError::NetworkError("timed out".into())),
            };
            let _ = tx.send(EngineInput::BatchFetched { token, result });
        });
    }

    fn request_art(&mut self) {
        let Some(song) = &self.song else {
            return;
        };
        let Some(url) = song.art_url.clone() else {
            return;
        };
        let song_id = song.id.clone();
        let token = self.ops.issue(OpKind::Art);
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        let timeout = self.config.fetch_timeout();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, service.fetch_art(&url)).await {
                Ok(result) => result,
                Err(_) => Err(QueueError::NetworkError("timed out".into())),
            };
            let _ = tx.send(EngineInput::ArtFetched {
                token,
                song_id,
                result,
            });
        });
    }

    /// Drop the station, its queue, the song and every in-flight operation.
    /// Leaves `state` alone.
    fn teardown(&mut self) {
        self.release_stream();
        self.ops.cancel_all();
        self.queue = None;
        self.set_song(None);
        if self.station.take().is_some() {
            self.bus.publish(PlaybackEvent::StationChanged(None));
        }
        self.song_attempts = 0;
        self.failed_songs = 0;
        self.fetch_failures = 0;
        self.interruption_paused = false;
    }

    fn fail_station(&mut self, reason: FailureReason) {
        let name = self
            .station
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        warn!("engine: station {} failed: {}", name, reason);
        self.teardown();
        self.set_state(TransportState::Failed(reason));
        self.set_state(TransportState::Idle);
    }

    fn publish_auth_expired(&mut self) {
        let station = self
            .station
            .clone()
            .or_else(|| self.last_station.clone())
            .unwrap_or_default();
        self.bus.publish(PlaybackEvent::AuthExpired { station });
    }

    fn set_state(&mut self, new: TransportState) {
        if self.state == new {
            return;
        }
        let old = std::mem::replace(&mut self.state, new.clone());
        debug!("engine: {} -> {}", old.label(), new.label());
        self.bus.publish(PlaybackEvent::StateChanged { old, new });
    }

    fn publish_progress(&self) {
        self.bus.publish(PlaybackEvent::ProgressChanged {
            elapsed: self.elapsed,
            duration: self.duration,
        });
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.flush() {
            warn!("engine: failed to persist state: {}", e);
        }
    }
}
