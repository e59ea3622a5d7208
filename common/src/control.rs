use crate::{
    config::TimingConfig,
    error::{LimitError, NetworkError, RelayFailure, SensorError},
    relay::RelayOutcome,
    types::{ErrorClass, FaultKind, Phase, RelayCommand, StatusSignal, StatusView},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Connect { reset_link: bool },
    StartApi,
    Tick,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    Signal(StatusSignal),
    Actuate(RelayCommand),
}

/// One pending deadline per job kind; scheduling a kind again replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Agenda {
    connect: Option<(u64, bool)>,
    start_api: Option<u64>,
    tick: Option<u64>,
}

impl Agenda {
    pub fn schedule(&mut self, job: Job, due_ms: u64) {
        match job {
            Job::Connect { reset_link } => self.connect = Some((due_ms, reset_link)),
            Job::StartApi => self.start_api = Some(due_ms),
            Job::Tick => self.tick = Some(due_ms),
        }
    }

    pub fn is_pending(&self, job: Job) -> bool {
        match job {
            Job::Connect { .. } => self.connect.is_some(),
            Job::StartApi => self.start_api.is_some(),
            Job::Tick => self.tick.is_some(),
        }
    }

    pub fn due_at(&self, job: Job) -> Option<u64> {
        match job {
            Job::Connect { .. } => self.connect.map(|(due, _)| due),
            Job::StartApi => self.start_api,
            Job::Tick => self.tick,
        }
    }

    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.connect.map(|(due, _)| due),
            self.start_api,
            self.tick,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Pops the earliest job due at `now_ms`. Bootstrap work wins ties.
    pub fn take_due(&mut self, now_ms: u64) -> Option<Job> {
        let mut best: Option<(u64, Job)> = None;
        let candidates = [
            self.connect
                .map(|(due, reset_link)| (due, Job::Connect { reset_link })),
            self.start_api.map(|due| (due, Job::StartApi)),
            self.tick.map(|due| (due, Job::Tick)),
        ];

        for (due, job) in candidates.into_iter().flatten() {
            if due > now_ms {
                continue;
            }
            if best.map(|(best_due, _)| due < best_due).unwrap_or(true) {
                best = Some((due, job));
            }
        }

        let (_, job) = best?;
        match job {
            Job::Connect { .. } => self.connect = None,
            Job::StartApi => self.start_api = None,
            Job::Tick => self.tick = None,
        }
        Some(job)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub phase: Phase,
    pub limit_c: f32,
    pub last_reading_c: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ControlMachine {
    pub timing: TimingConfig,
    state: DeviceState,
    agenda: Agenda,
    bootstrapping: bool,
    link_suspect: bool,
    signalled: Option<ErrorClass>,
}

impl ControlMachine {
    pub fn new(timing: TimingConfig, limit_c: f32) -> Self {
        Self {
            timing,
            state: DeviceState {
                phase: Phase::Booting,
                limit_c,
                last_reading_c: None,
            },
            agenda: Agenda::default(),
            bootstrapping: false,
            link_suspect: false,
            signalled: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn limit_c(&self) -> f32 {
        self.state.limit_c
    }

    pub fn last_reading_c(&self) -> Option<f32> {
        self.state.last_reading_c
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    pub fn start(&mut self, now_ms: u64) {
        self.begin_bootstrap(now_ms);
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<Job> {
        self.agenda.take_due(now_ms)
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.agenda.next_deadline()
    }

    pub fn validate_limit(raw: &str) -> Result<f32, LimitError> {
        crate::config::parse_limit(raw)
    }

    pub fn commit_limit(&mut self, limit_c: f32) {
        self.state.limit_c = limit_c;
    }

    pub fn on_associated(
        &mut self,
        result: Result<(), NetworkError>,
        now_ms: u64,
    ) -> Vec<ControlAction> {
        match result {
            Ok(()) => {
                self.link_suspect = false;
                self.agenda
                    .schedule(Job::StartApi, now_ms + self.timing.settle_delay_ms);
                Vec::new()
            }
            Err(err) => self.bootstrap_failed(&err, now_ms),
        }
    }

    pub fn on_api_started(
        &mut self,
        result: Result<(), NetworkError>,
        now_ms: u64,
    ) -> Vec<ControlAction> {
        if let Err(err) = result {
            return self.bootstrap_failed(&err, now_ms);
        }

        self.bootstrapping = false;
        self.state.phase = Phase::Running;
        // After a reconnect the tick chain is still armed; never start a second one.
        if !self.agenda.is_pending(Job::Tick) {
            self.agenda.schedule(Job::Tick, now_ms);
        }
        // Sensor and actuator codes stay up until a tick clears them.
        match self.signalled {
            Some(ErrorClass::Sensor | ErrorClass::Actuator) => Vec::new(),
            Some(ErrorClass::Connectivity | ErrorClass::Generic) | None => vec![self.signal_ok()],
        }
    }

    pub fn on_reading(
        &mut self,
        reading: Result<f32, SensorError>,
        now_ms: u64,
    ) -> Vec<ControlAction> {
        let temp_c = match reading {
            Ok(temp_c) if temp_c.is_finite() => temp_c,
            Ok(_) | Err(_) => {
                self.state.phase = Phase::Errored(FaultKind::Sensor);
                self.schedule_retry_tick(now_ms);
                return vec![self.signal_error(ErrorClass::Sensor)];
            }
        };

        self.state.last_reading_c = Some(temp_c);

        if self.state.phase == Phase::Errored(FaultKind::Connectivity) {
            self.schedule_retry_tick(now_ms);
            return Vec::new();
        }

        vec![ControlAction::Actuate(RelayCommand::for_reading(
            temp_c,
            self.state.limit_c,
        ))]
    }

    pub fn on_relay_outcome(&mut self, outcome: &RelayOutcome, now_ms: u64) -> Vec<ControlAction> {
        match outcome {
            Ok(_) => {
                self.state.phase = Phase::Running;
                self.agenda
                    .schedule(Job::Tick, now_ms + self.timing.poll_interval_ms);
                vec![self.signal_ok()]
            }
            Err(RelayFailure::LinkDown) => {
                self.state.phase = Phase::Errored(FaultKind::Connectivity);
                self.link_suspect = true;
                self.schedule_retry_tick(now_ms);
                if !self.bootstrapping {
                    self.begin_bootstrap(now_ms);
                }
                vec![self.signal_error(ErrorClass::Connectivity)]
            }
            Err(_) => {
                self.state.phase = Phase::Errored(FaultKind::Actuator);
                self.schedule_retry_tick(now_ms);
                vec![self.signal_error(ErrorClass::Actuator)]
            }
        }
    }

    pub fn status(&self, last_reading_epoch: Option<i64>) -> StatusView {
        StatusView {
            phase: self.state.phase.as_str(),
            limit: self.state.limit_c,
            t: self.state.last_reading_c,
            led_code: self.signalled.map(ErrorClass::code),
            last_reading_epoch,
        }
    }

    fn begin_bootstrap(&mut self, now_ms: u64) {
        self.bootstrapping = true;
        self.agenda.schedule(
            Job::Connect {
                reset_link: self.link_suspect,
            },
            now_ms,
        );
    }

    fn bootstrap_failed(&mut self, err: &NetworkError, now_ms: u64) -> Vec<ControlAction> {
        let class = err.class();
        if class == ErrorClass::Connectivity {
            self.state.phase = Phase::Errored(FaultKind::Connectivity);
            self.link_suspect = true;
        }
        self.bootstrapping = true;
        self.agenda.schedule(
            Job::Connect {
                reset_link: self.link_suspect,
            },
            now_ms + self.timing.bootstrap_backoff_ms,
        );
        vec![self.signal_error(class)]
    }

    fn schedule_retry_tick(&mut self, now_ms: u64) {
        self.agenda
            .schedule(Job::Tick, now_ms + self.timing.retry_interval_ms);
    }

    fn signal_error(&mut self, class: ErrorClass) -> ControlAction {
        self.signalled = Some(class);
        ControlAction::Signal(StatusSignal::Error(class))
    }

    fn signal_ok(&mut self) -> ControlAction {
        self.signalled = None;
        ControlAction::Signal(StatusSignal::Ok)
    }
}
