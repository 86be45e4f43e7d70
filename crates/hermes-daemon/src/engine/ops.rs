//! Identity tokens for in-flight async work.
//!
//! Each kind of operation keeps only its latest token.  Issuing a new one
//! for the same kind, or cancelling, makes every older token stale, and a
//! completion carrying a stale token is dropped by the engine.

use std::collections::HashMap;

/// Identity of one async operation.  Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpToken(u64);

impl std::fmt::Display for OpToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Song batch request to the station service.
    Fetch,
    /// The currently opened audio stream (many events per token).
    Stream,
    /// Artwork download for the current song.
    Art,
}

#[derive(Debug, Default)]
pub struct PendingOps {
    next_id: u64,
    pending: HashMap<OpKind, OpToken>,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new operation, superseding any pending one of the same kind.
    pub fn issue(&mut self, kind: OpKind) -> OpToken {
        self.next_id += 1;
        let token = OpToken(self.next_id);
        self.pending.insert(kind, token);
        token
    }

    /// True if `token` is still the latest of its kind.  Does not consume.
    pub fn is_current(&self, kind: OpKind, token: OpToken) -> bool {
        self.pending.get(&kind) == Some(&token)
    }

    /// Accept a one-shot completion: true (and cleared) only if current.
    pub fn accept(&mut self, kind: OpKind, token: OpToken) -> bool {
        if self.is_current(kind, token) {
            self.pending.remove(&kind);
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self, kind: OpKind) {
        self.pending.remove(&kind);
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    pub fn is_pending(&self, kind: OpKind) -> bool {
        self.pending.contains_key(&kind)
    }
}
