/// SongQueue: upcoming songs for the current station.
///
/// The queue itself never talks to the network.  It only decides *when* a
/// refill is needed: after a dequeue leaves `low_water_mark` songs or fewer,
/// `take_refill_request()` returns true exactly once, and stays false until
/// the engine reports the refill finished.
use std::collections::VecDeque;

use hermes_proto::protocol::{Song, Station};

#[derive(Debug)]
pub struct SongQueue {
    station: Station,
    songs: VecDeque<Song>,
    low_water_mark: usize,
    refill_wanted: bool,
    refill_in_flight: bool,
    /// Batches in a row that came back empty.
    empty_batches: u32,
}

impl SongQueue {
    pub fn new(station: Station, low_water_mark: usize) -> Self {
        Self {
            station,
            songs: VecDeque::new(),
            low_water_mark,
            refill_wanted: false,
            refill_in_flight: false,
            empty_batches: 0,
        }
    }

    pub fn station(&self) -> &Station {
        &self.station
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }

    pub fn is_refill_in_flight(&self) -> bool {
        self.refill_in_flight
    }

    pub fn empty_batches(&self) -> u32 {
        self.empty_batches
    }

    /// Append a fetched batch, tagging each song with the queue's station.
    /// Returns how many songs were added; an empty batch counts towards
    /// `empty_batches`.
    pub fn extend(&mut self, batch: Vec<Song>) -> usize {
        let added = batch.len();
        if added == 0 {
            self.empty_batches += 1;
        } else {
            self.empty_batches = 0;
            let station_id = &self.station.id;
            self.songs.extend(batch.into_iter().map(|mut song| {
                song.station_id = station_id.clone();
                song
            }));
        }
        if self.songs.len() > self.low_water_mark {
            self.refill_wanted = false;
        }
        added
    }

    pub fn dequeue_next(&mut self) -> Option<Song> {
        let song = self.songs.pop_front();
        if self.songs.len() <= self.low_water_mark {
            self.refill_wanted = true;
        }
        song
    }

    /// True once per refill: the caller is expected to start a fetch.
    pub fn take_refill_request(&mut self) -> bool {
        if self.refill_wanted && !self.refill_in_flight {
            self.refill_wanted = false;
            self.refill_in_flight = true;
            true
        } else {
            false
        }
    }

    /// Force a refill regardless of the low-water mark (first batch, or
    /// the engine is starved).  Returns false when one is already running.
    pub fn begin_refill(&mut self) -> bool {
        if self.refill_in_flight {
            return false;
        }
        self.refill_wanted = false;
        self.refill_in_flight = true;
        true
    }

    pub fn refill_finished(&mut self) {
        self.refill_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: &str) -> Song {
        Song {
            id: id.into(),
            title: id.into(),
            stream_url: format!("http://audio.example/{id}.mp3"),
            ..Default::default()
        }
    }

    fn queue_with(ids: &[&str]) -> SongQueue {
        let mut q = SongQueue::new(Station::default(), 1);
        q.extend(ids.iter().map(|id| song(id)).collect());
        q
    }

    #[test]
    fn test_refill_requested_exactly_once_at_low_water() {
        let mut q = queue_with(&["A", "B", "C"]);

        assert_eq!(q.dequeue_next().unwrap().id, "A");
        assert!(!q.take_refill_request(), "two left: above the mark");

        assert_eq!(q.dequeue_next().unwrap().id, "B");
        assert!(q.take_refill_request(), "one left: at the mark");
        assert!(!q.take_refill_request(), "already in flight");

        assert_eq!(q.dequeue_next().unwrap().id, "C");
        assert!(!q.take_refill_request(), "still in flight");

        q.refill_finished();
        assert!(q.take_refill_request(), "still starved after the refill");
    }

    #[test]
    fn test_refill_finished_with_songs_rearms() {
        let mut q = queue_with(&["A", "B"]);
        q.dequeue_next();
        assert!(q.take_refill_request());
        q.extend(vec![song("C"), song("D"), song("E")]);
        q.refill_finished();

        assert!(!q.take_refill_request());
        assert_eq!(q.len(), 4);
        q.dequeue_next();
        q.dequeue_next();
        assert!(!q.take_refill_request());
        q.dequeue_next();
        assert!(q.take_refill_request());
    }

    #[test]
    fn test_refill_above_the_mark_drops_pending_request() {
        let mut q = queue_with(&["A", "B"]);
        q.dequeue_next();
        assert!(q.take_refill_request());
        q.dequeue_next();
        q.extend(vec![song("C"), song("D"), song("E")]);
        q.refill_finished();
        assert!(!q.take_refill_request());
    }

    #[test]
    fn test_empty_batches_are_counted_until_songs_arrive() {
        let mut q = SongQueue::new(Station::default(), 1);
        assert_eq!(q.extend(Vec::new()), 0);
        assert_eq!(q.extend(Vec::new()), 0);
        assert_eq!(q.empty_batches(), 2);
        assert_eq!(q.extend(vec![song("A")]), 1);
        assert_eq!(q.empty_batches(), 0);
    }

    #[test]
    fn test_begin_refill_respects_in_flight() {
        let mut q = SongQueue::new(Station::default(), 1);
        assert!(q.begin_refill());
        assert!(!q.begin_refill());
        assert!(q.is_refill_in_flight());
        q.refill_finished();
        assert!(q.begin_refill());
    }

    #[test]
    fn test_extend_stamps_the_station() {
        let station = Station {
            id: "st1".into(),
            ..Default::default()
        };
        let mut q = SongQueue::new(station, 1);
        let mut foreign = song("a1");
        foreign.station_id = "other".into();
        q.extend(vec![foreign, song("a2")]);
        assert_eq!(q.dequeue_next().unwrap().station_id, "st1");
        assert_eq!(q.dequeue_next().unwrap().station_id, "st1");
    }

    #[test]
    fn test_dequeue_on_empty_queue() {
        let mut q = SongQueue::new(Station::default(), 1);
        assert!(q.dequeue_next().is_none());
        assert!(q.take_refill_request());
    }
}
