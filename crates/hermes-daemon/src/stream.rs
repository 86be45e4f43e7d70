/// AudioStream contract between the engine and an audio backend.
///
/// `AudioBackend::open` returns a handle immediately; connecting, buffering
/// and decoding happen elsewhere and are reported back through the
/// `StreamEventSink` handed to `open`.  Every event carries the `OpToken` of
/// the open that produced it, so the engine can drop events from streams it
/// has already abandoned.
use hermes_proto::error::StreamError;
use tokio::sync::mpsc;

use crate::engine::{EngineInput, OpToken};

/// What a stream reports while it plays.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    /// Audio is flowing.
    Opened,
    /// Buffer fill in 0.0..=1.0, `None` when the backend can't tell.
    Buffering(Option<f32>),
    Progress {
        elapsed: f64,
        total: Option<f64>,
    },
    Finished,
    Failed(StreamError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub token: OpToken,
    pub kind: StreamEventKind,
}

/// Where a backend sends the events of one opened stream.
#[derive(Debug, Clone)]
pub struct StreamEventSink {
    token: OpToken,
    tx: mpsc::UnboundedSender<EngineInput>,
}

impl StreamEventSink {
    pub fn new(token: OpToken, tx: mpsc::UnboundedSender<EngineInput>) -> Self {
        Self { token, tx }
    }

    pub fn token(&self) -> OpToken {
        self.token
    }

    /// Returns false once the engine is gone.
    pub fn emit(&self, kind: StreamEventKind) -> bool {
        self.tx
            .send(EngineInput::Stream(StreamEvent {
                token: self.token,
                kind,
            }))
            .is_ok()
    }
}

/// Transport control over one opened stream.  None of these may block.
pub trait AudioStream: Send {
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    /// 0..=100
    fn set_volume(&mut self, volume: u8);
}

/// Opens streams.  One backend lives for the whole process.
pub trait AudioBackend: Send + Sync {
    fn open(&self, url: &str, volume: u8, sink: StreamEventSink) -> Box<dyn AudioStream>;
}
