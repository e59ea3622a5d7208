use std::time::Duration;

use crate::error::RelayFailure;

pub type RelayOutcome = Result<String, RelayFailure>;

#[derive(Debug)]
pub struct RelayResponse {
    body: Vec<u8>,
}

impl RelayResponse {
    pub fn accept(status: u16) -> Result<Self, RelayFailure> {
        if status != 200 {
            return Err(RelayFailure::HttpStatus(status));
        }
        Ok(Self { body: Vec::new() })
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Chunks are decoded together so a code point split across two reads
    /// survives.
    pub fn finish(self) -> String {
        match String::from_utf8(self.body) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

const DEADLINE_SLICES: u32 = 4;

/// Each blocking operation gets one slice of the budget, so a call overruns it
/// by at most one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDeadline {
    budget: Duration,
}

impl RelayDeadline {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn io_timeout(&self) -> Duration {
        (self.budget / DEADLINE_SLICES).max(Duration::from_millis(1))
    }

    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.budget
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }

    pub fn failure(&self, op: Duration, elapsed: Duration, message: String) -> RelayFailure {
        if op >= self.io_timeout() || self.remaining(elapsed).is_none() {
            RelayFailure::Timeout
        } else {
            RelayFailure::Transport(message)
        }
    }
}
