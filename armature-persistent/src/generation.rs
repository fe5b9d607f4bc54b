//! Generation counters used to invalidate connections lazily.
//!
//! Every connection is filed under the generation that was current when it was
//! created. Bumping a counter never touches a connection directly; each worker
//! notices the new value on its next lookup and reclaims whatever it still
//! holds from older generations.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which counter a destination is governed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    /// Plain `http` destinations.
    Transport,
    /// `https` destinations.
    Tls,
}

impl Track {
    /// Track for a URL scheme.
    pub fn for_scheme(scheme: &str) -> Self {
        if scheme.eq_ignore_ascii_case("https") {
            Self::Tls
        } else {
            Self::Transport
        }
    }
}

/// Monotonic generation pair.
#[derive(Debug, Default)]
pub struct Generations {
    transport: AtomicU64,
    ssl: AtomicU64,
}

impl Generations {
    /// Create counters starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for a track.
    pub fn current(&self, track: Track) -> u64 {
        match track {
            Track::Transport => self.transport.load(Ordering::Acquire),
            Track::Tls => self.ssl.load(Ordering::Acquire),
        }
    }

    /// Current transport generation.
    pub fn transport(&self) -> u64 {
        self.current(Track::Transport)
    }

    /// Current TLS generation.
    pub fn ssl(&self) -> u64 {
        self.current(Track::Tls)
    }

    /// Increment one track, returning the new value.
    pub fn bump(&self, track: Track) -> u64 {
        let counter = match track {
            Track::Transport => &self.transport,
            Track::Tls => &self.ssl,
        };
        counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Increment both tracks.
    pub fn bump_both(&self) -> (u64, u64) {
        (self.bump(Track::Transport), self.bump(Track::Tls))
    }
}
