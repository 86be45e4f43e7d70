//! Scripted collaborators for engine-level tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hermes_proto::error::QueueError;
use hermes_proto::protocol::{Song, Station};

use crate::service::StationService;
use crate::stream::{AudioBackend, AudioStream, StreamEventSink};

pub fn url(id: &str) -> String {
    format!("http://audio.test/{id}.mp3")
}

pub fn song(id: &str) -> Song {
    Song {
        id: id.into(),
        title: format!("Title {id}"),
        artist: "Artist".into(),
        stream_url: url(id),
        ..Default::default()
    }
}

/// `song(id)` as it looks once queued for `station_id`.
pub fn queued(station_id: &str, id: &str) -> Song {
    Song {
        station_id: station_id.into(),
        ..song(id)
    }
}

pub fn station(id: &str) -> Station {
    Station {
        id: id.into(),
        name: format!("Station {id}"),
        ..Default::default()
    }
}

pub fn batch(ids: &[&str]) -> Result<Vec<Song>, QueueError> {
    Ok(ids.iter().map(|id| song(id)).collect())
}

// ── station service ───────────────────────────────────────────────────────────

/// Hands out queued batches in order, then empty ones.
#[derive(Default)]
pub struct MockService {
    pub batches: Mutex<VecDeque<Result<Vec<Song>, QueueError>>>,
    pub fetches: AtomicUsize,
    /// Batch requests never complete.
    pub hang: bool,
    pub rating_error: Option<QueueError>,
    pub ratings: Mutex<Vec<(String, bool)>>,
    /// Station id sent with each rating, in order.
    pub rated_stations: Mutex<Vec<String>>,
    pub tired: Mutex<Vec<String>>,
    pub art: Option<Vec<u8>>,
}

impl MockService {
    pub fn with_batches(batches: Vec<Result<Vec<Song>, QueueError>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Default::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StationService for MockService {
    async fn fetch_batch(&self, _station: &Station) -> Result<Vec<Song>, QueueError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.batches.lock().unwrap().pop_front();
        next.unwrap_or(Ok(Vec::new()))
    }

    async fn submit_rating(
        &self,
        station: &Station,
        song: &Song,
        liked: bool,
    ) -> Result<(), QueueError> {
        self.ratings.lock().unwrap().push((song.id.clone(), liked));
        self.rated_stations.lock().unwrap().push(station.id.clone());
        match &self.rating_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn submit_tired(&self, _station: &Station, song: &Song) -> Result<(), QueueError> {
        self.tired.lock().unwrap().push(song.id.clone());
        Ok(())
    }

    async fn fetch_art(&self, url: &str) -> Result<Vec<u8>, QueueError> {
        self.art
            .clone()
            .ok_or_else(|| QueueError::NetworkError(format!("no art at {url}")))
    }
}

// ── audio backend ─────────────────────────────────────────────────────────────

/// Records every call as "<action> <url>".
#[derive(Default)]
pub struct MockBackend {
    log: Arc<Mutex<Vec<String>>>,
    sinks: Mutex<Vec<StreamEventSink>>,
}

impl MockBackend {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn opens(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|l| l.strip_prefix("open ").map(str::to_string))
            .collect()
    }

    pub fn last_sink(&self) -> StreamEventSink {
        self.sinks
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing opened")
    }
}

struct MockStream {
    url: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockStream {
    fn record(&self, action: &str) {
        self.log.lock().unwrap().push(format!("{action} {}", self.url));
    }
}

impl AudioStream for MockStream {
    fn pause(&mut self) {
        self.record("pause");
    }

    fn resume(&mut self) {
        self.record("resume");
    }

    fn stop(&mut self) {
        self.record("stop");
    }

    fn set_volume(&mut self, volume: u8) {
        self.record(&format!("volume={volume}"));
    }
}

impl AudioBackend for MockBackend {
    fn open(&self, url: &str, _volume: u8, sink: StreamEventSink) -> Box<dyn AudioStream> {
        self.log.lock().unwrap().push(format!("open {url}"));
        self.sinks.lock().unwrap().push(sink);
        Box::new(MockStream {
            url: url.to_string(),
            log: Arc::clone(&self.log),
        })
    }
}
