use crate::types::{ErrorClass, StatusSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlinkTiming {
    pub heartbeat_on_ms: u64,
    pub heartbeat_off_ms: u64,
    pub pulse_ms: u64,
    pub pause_ms: u64,
}

impl Default for BlinkTiming {
    fn default() -> Self {
        Self {
            heartbeat_on_ms: 1_000,
            heartbeat_off_ms: 1_000,
            pulse_ms: 300,
            pause_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkMode {
    Heartbeat,
    ErrorCode(u8),
}

impl BlinkMode {
    pub fn code(self) -> Option<u8> {
        match self {
            Self::Heartbeat => None,
            Self::ErrorCode(code) => Some(code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkStep {
    pub level: bool,
    pub hold_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BlinkEncoder {
    timing: BlinkTiming,
    mode: BlinkMode,
    lit: bool,
    transitions: u32,
    active: bool,
}

impl BlinkEncoder {
    pub fn new(timing: BlinkTiming) -> Self {
        Self {
            timing,
            mode: BlinkMode::Heartbeat,
            lit: false,
            transitions: 0,
            active: false,
        }
    }

    pub fn mode(&self) -> BlinkMode {
        self.mode
    }

    pub fn set_error(&mut self, class: ErrorClass) -> bool {
        self.switch_to(BlinkMode::ErrorCode(class.code()))
    }

    pub fn clear_error(&mut self) -> bool {
        self.switch_to(BlinkMode::Heartbeat)
    }

    pub fn apply(&mut self, signal: StatusSignal) -> bool {
        match signal {
            StatusSignal::Ok => self.clear_error(),
            StatusSignal::Error(class) => self.set_error(class),
        }
    }

    // true when the pattern restarts; the running pattern is left mid-cycle
    pub fn switch_to(&mut self, mode: BlinkMode) -> bool {
        if self.active && self.mode == mode {
            return false;
        }
        self.mode = mode;
        self.lit = false;
        self.transitions = 0;
        self.active = false;
        true
    }

    pub fn advance(&mut self) -> BlinkStep {
        self.active = true;
        self.lit = !self.lit;

        let hold_ms = match self.mode {
            BlinkMode::Heartbeat => {
                if self.lit {
                    self.timing.heartbeat_on_ms
                } else {
                    self.timing.heartbeat_off_ms
                }
            }
            BlinkMode::ErrorCode(code) => {
                // 2n level changes per cycle: n pulses, the last one ending low
                let last = 2 * u32::from(code.max(1)) - 1;
                if self.transitions >= last {
                    self.transitions = 0;
                    self.timing.pause_ms
                } else {
                    self.transitions += 1;
                    self.timing.pulse_ms
                }
            }
        };

        BlinkStep {
            level: self.lit,
            hold_ms,
        }
    }
}

impl Default for BlinkEncoder {
    fn default() -> Self {
        Self::new(BlinkTiming::default())
    }
}
