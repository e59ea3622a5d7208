use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};

use thermorelay_common::{
    sht30, AgentConfig, BlinkTiming, ConfigStore, ControlAction, ControlMachine, Credentials, Job,
    NetworkError, Phase, RelayCommand, RelayFailure, RelayOutcome, SensorError, StatusSignal,
    StoreError, TimingConfig,
};

use crate::{
    api::{self, AppState},
    led::{self, LoggedLed},
    relay_client::RelayClient,
};

pub trait Link {
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError>;
    async fn reset(&mut self);
    fn is_connected(&self) -> bool;
}

pub trait Sensor {
    async fn measure(&mut self) -> Result<f32, SensorError>;
}

pub trait Relay {
    async fn call(&self, command: RelayCommand) -> RelayOutcome;
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(JsonFileStore::open(JsonFileStore::default_path()).unwrap_or_else(
        |err| {
            warn!("failed to load config store, starting empty: {err}");
            JsonFileStore::empty(JsonFileStore::default_path())
        },
    ));
    let mut config = AgentConfig::load(store.as_ref()).context("failed to read config store")?;
    apply_env_overrides(&mut config);

    info!(
        "config loaded: ssid=`{}`, relay=`{}`, limit={}",
        config.credentials.ssid,
        config.relay.host_header(),
        config.limit_c
    );
    if !config.has_credentials() {
        warn!("no WiFi SSID configured; set WIFI_SSID");
    }

    let timing = TimingConfig::default();
    let relay = RelayClient::new(
        config.relay.clone(),
        Duration::from_millis(timing.relay_timeout_ms),
    )?;

    let (led_tx, led_rx) = watch::channel(StatusSignal::Ok);
    let _led = led::spawn_status_led(BlinkTiming::default(), led_rx, LoggedLed::default());

    let state = AppState {
        machine: Arc::new(Mutex::new(ControlMachine::new(timing, config.limit_c))),
        store,
        last_reading_epoch: Arc::new(Mutex::new(None)),
    };

    let port = std::env::var("AGENT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let mut agent = Agent {
        state: state.clone(),
        link: SimulatedLink::default(),
        sensor: SimulatedSht30::from_env(),
        relay,
        api: ApiServer::new(addr, state),
        led: led_tx,
        credentials: config.credentials,
        clock: Instant::now(),
    };

    agent.start().await;
    tokio::select! {
        () = agent.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutting down");
        }
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        config.credentials.ssid = ssid;
    }
    if let Ok(password) = std::env::var("WIFI_PASS") {
        config.credentials.password = password;
    }
    if let Ok(host) = std::env::var("RELAY_HOST") {
        config.relay.host = host;
    }
    if let Some(port) = std::env::var("RELAY_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.relay.port = port;
    }
}

/// Only this task changes the machine's phase; the API only commits a new limit.
struct Agent<L, S, R> {
    state: AppState,
    link: L,
    sensor: S,
    relay: R,
    api: ApiServer,
    led: watch::Sender<StatusSignal>,
    credentials: Credentials,
    clock: Instant,
}

impl<L: Link, S: Sensor, R: Relay> Agent<L, S, R> {
    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }

    async fn start(&mut self) {
        let now_ms = self.now_ms();
        self.state.machine.lock().await.start(now_ms);
    }

    async fn run(&mut self) {
        loop {
            if self.step().await.is_some() {
                continue;
            }

            let (deadline, fallback_ms) = {
                let machine = self.state.machine.lock().await;
                (machine.next_deadline(), machine.timing.retry_interval_ms)
            };
            let wait_ms = match deadline {
                Some(due_ms) => due_ms.saturating_sub(self.now_ms()),
                None => fallback_ms,
            };
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    async fn step(&mut self) -> Option<Job> {
        let now_ms = self.now_ms();
        let job = self.state.machine.lock().await.poll(now_ms)?;

        match job {
            Job::Connect { reset_link } => self.connect(reset_link).await,
            Job::StartApi => self.start_api().await,
            Job::Tick => self.tick().await,
        }
        Some(job)
    }

    async fn connect(&mut self, reset_link: bool) {
        if reset_link {
            info!("resetting network link before reconnect");
            self.link.reset().await;
        }

        info!("connecting to `{}`", self.credentials.ssid);
        let result = self.link.connect(&self.credentials).await;
        if let Err(err) = &result {
            warn!("network connect failed: {err}");
        }

        let now_ms = self.now_ms();
        let actions = {
            let mut machine = self.state.machine.lock().await;
            let actions = machine.on_associated(result, now_ms);
            if !actions.is_empty() {
                log_phase(machine.phase());
            }
            actions
        };
        self.execute(actions).await;
    }

    async fn start_api(&mut self) {
        let result = self.api.start().await.map(|addr| {
            info!("local api listening on http://{addr}");
        });
        if let Err(err) = &result {
            warn!("local api start failed: {err}");
        }

        let now_ms = self.now_ms();
        let actions = {
            let mut machine = self.state.machine.lock().await;
            let actions = machine.on_api_started(result, now_ms);
            log_phase(machine.phase());
            actions
        };
        self.execute(actions).await;
    }

    async fn tick(&mut self) {
        let reading = self.sensor.measure().await;
        match &reading {
            Ok(temp_c) => {
                info!(temp_c, "temperature measured");
                *self.state.last_reading_epoch.lock().await = Some(Utc::now().timestamp());
            }
            Err(err) => warn!("temperature measurement failed: {err}"),
        }

        let now_ms = self.now_ms();
        let actions = {
            let mut machine = self.state.machine.lock().await;
            let actions = machine.on_reading(reading, now_ms);
            if !actions.is_empty() {
                log_phase(machine.phase());
            }
            actions
        };
        self.execute(actions).await;
    }

    async fn execute(&mut self, actions: Vec<ControlAction>) {
        let mut pending = actions;
        while !pending.is_empty() {
            let mut follow_up = Vec::new();
            for action in pending {
                match action {
                    ControlAction::Signal(signal) => {
                        self.led.send_replace(signal);
                    }
                    ControlAction::Actuate(command) => {
                        info!(command = command.as_str(), "actuating relay");
                        let outcome = self.actuate(command).await;
                        let now_ms = self.now_ms();
                        let mut machine = self.state.machine.lock().await;
                        follow_up.extend(machine.on_relay_outcome(&outcome, now_ms));
                        log_phase(machine.phase());
                    }
                }
            }
            pending = follow_up;
        }
    }

    async fn actuate(&self, command: RelayCommand) -> RelayOutcome {
        match self.relay.call(command).await {
            Err(RelayFailure::Transport(reason)) if !self.link.is_connected() => {
                warn!("relay transport failed with the link down: {reason}");
                Err(RelayFailure::LinkDown)
            }
            outcome => outcome,
        }
    }
}

fn log_phase(phase: Phase) {
    if phase.is_errored() {
        warn!(phase = phase.as_str(), "device phase");
    } else {
        info!(phase = phase.as_str(), "device phase");
    }
}

struct ApiServer {
    addr: SocketAddr,
    state: AppState,
    task: Option<JoinHandle<()>>,
}

impl ApiServer {
    fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            state,
            task: None,
        }
    }

    async fn start(&mut self) -> Result<SocketAddr, NetworkError> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|err| NetworkError::Failed(format!("failed to bind {}: {err}", self.addr)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| NetworkError::Failed(err.to_string()))?;

        let app = api::router(self.state.clone());
        self.task = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("local api stopped: {err}");
            }
        }));
        Ok(local_addr)
    }
}

pub struct JsonFileStore {
    path: PathBuf,
    entries: StdMutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn default_path() -> PathBuf {
        std::env::var("THERMORELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.thermorelay"))
            .join("config.json")
    }

    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            entries: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<BTreeMap<String, String>>(&raw)
                .map_err(|err| StoreError::Encoding(err.to_string()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };

        Ok(Self {
            path,
            entries: StdMutex::new(entries),
        })
    }

    fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| StoreError::Io(err.to_string()))?;
        }
        let payload =
            serde_json::to_vec_pretty(entries).map_err(|err| StoreError::Encoding(err.to_string()))?;
        std::fs::write(&self.path, payload).map_err(|err| StoreError::Io(err.to_string()))
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Io("store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Io("store lock poisoned".to_string()))?;
        let mut updated = entries.clone();
        updated.insert(key.to_string(), value.to_string());
        self.write(&updated)?;
        *entries = updated;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SimulatedLink {
    connected: bool,
}

impl Link for SimulatedLink {
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        if credentials.ssid.is_empty() {
            warn!("no SSID configured; simulated link connects anyway");
        }
        self.connected = true;
        Ok(())
    }

    async fn reset(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Debug)]
pub struct SimulatedSht30 {
    base_c: f32,
    reads: u64,
}

impl SimulatedSht30 {
    pub fn new(base_c: f32) -> Self {
        Self { base_c, reads: 0 }
    }

    fn from_env() -> Self {
        let base_c = std::env::var("SIM_TEMP_C")
            .ok()
            .and_then(|value| value.parse::<f32>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(19.0);
        Self::new(base_c)
    }
}

impl Sensor for SimulatedSht30 {
    async fn measure(&mut self) -> Result<f32, SensorError> {
        self.reads = self.reads.saturating_add(1);
        let celsius = self.base_c + (self.reads % 8) as f32 * 0.25;
        sht30::decode_temperature(&sht30::encode_temperature(celsius))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;
    use thermorelay_common::{
        config::{KEY_PASSWD, KEY_SSID, KEY_TEMP_LIMIT},
        store::MemoryStore,
        ErrorClass, FaultKind,
    };

    use super::*;

    #[derive(Default)]
    struct FakeLink {
        results: VecDeque<Result<(), NetworkError>>,
        up: bool,
        connects: Vec<String>,
        resets: usize,
    }

    impl Link for FakeLink {
        async fn connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
            self.connects.push(credentials.ssid.clone());
            let result = self.results.pop_front().unwrap_or(Ok(()));
            self.up = result.is_ok();
            result
        }

        async fn reset(&mut self) {
            self.resets += 1;
            self.up = false;
        }

        fn is_connected(&self) -> bool {
            self.up
        }
    }

    struct FakeSensor {
        readings: VecDeque<Result<f32, SensorError>>,
    }

    impl Sensor for FakeSensor {
        async fn measure(&mut self) -> Result<f32, SensorError> {
            self.readings
                .pop_front()
                .unwrap_or(Err(SensorError::Bus("no more readings".into())))
        }
    }

    #[derive(Default)]
    struct FakeRelay {
        outcomes: StdMutex<VecDeque<RelayOutcome>>,
        calls: StdMutex<Vec<RelayCommand>>,
    }

    impl Relay for FakeRelay {
        async fn call(&self, command: RelayCommand) -> RelayOutcome {
            self.calls.lock().unwrap().push(command);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(String::new()))
        }
    }

    fn agent(
        store: Arc<dyn ConfigStore>,
        link: FakeLink,
        readings: Vec<Result<f32, SensorError>>,
        outcomes: Vec<RelayOutcome>,
    ) -> (Agent<FakeLink, FakeSensor, FakeRelay>, watch::Receiver<StatusSignal>) {
        let config = AgentConfig::load(store.as_ref()).unwrap();
        let state = AppState {
            machine: Arc::new(Mutex::new(ControlMachine::new(
                TimingConfig::default(),
                config.limit_c,
            ))),
            store,
            last_reading_epoch: Arc::new(Mutex::new(None)),
        };
        let (led_tx, led_rx) = watch::channel(StatusSignal::Ok);
        let agent = Agent {
            state: state.clone(),
            link,
            sensor: FakeSensor {
                readings: readings.into(),
            },
            relay: FakeRelay {
                outcomes: StdMutex::new(outcomes.into()),
                calls: StdMutex::default(),
            },
            api: ApiServer::new(SocketAddr::from(([127, 0, 0, 1], 0)), state),
            led: led_tx,
            credentials: config.credentials,
            clock: Instant::now(),
        };
        (agent, led_rx)
    }

    async fn phase(agent: &Agent<FakeLink, FakeSensor, FakeRelay>) -> Phase {
        agent.state.machine.lock().await.phase()
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_startup_reads_and_switches_relay_off() {
        let store = Arc::new(MemoryStore::with_entries([
            (KEY_SSID, "net"),
            (KEY_PASSWD, "pw"),
            (KEY_TEMP_LIMIT, "18"),
        ]));
        let (mut agent, led) = agent(store, FakeLink::default(), vec![Ok(22.0)], vec![]);

        agent.start().await;
        assert_eq!(agent.step().await, Some(Job::Connect { reset_link: false }));
        assert_eq!(agent.link.connects, vec!["net".to_string()]);

        // nothing is due while the network settles
        assert_eq!(agent.step().await, None);
        tokio::time::advance(Duration::from_millis(10_000)).await;
        assert_eq!(agent.step().await, Some(Job::StartApi));
        assert_eq!(phase(&agent).await, Phase::Running);

        assert_eq!(agent.step().await, Some(Job::Tick));
        assert_eq!(*agent.relay.calls.lock().unwrap(), vec![RelayCommand::Off]);
        assert_eq!(phase(&agent).await, Phase::Running);
        assert_eq!(agent.state.machine.lock().await.limit_c(), 18.0);
        assert_eq!(*led.borrow(), StatusSignal::Ok);
        assert!(agent.state.last_reading_epoch.lock().await.is_some());

        // next tick only after the long interval
        tokio::time::advance(Duration::from_millis(59_000)).await;
        assert_eq!(agent.step().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_signals_and_retries_with_reset() {
        let link = FakeLink {
            results: VecDeque::from([Err(NetworkError::NotConnected)]),
            ..FakeLink::default()
        };
        let (mut agent, led) = agent(Arc::new(MemoryStore::new()), link, vec![], vec![]);

        agent.start().await;
        agent.step().await;

        assert_eq!(*led.borrow(), StatusSignal::Error(ErrorClass::Connectivity));
        assert_eq!(phase(&agent).await, Phase::Errored(FaultKind::Connectivity));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(agent.step().await, None);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(agent.step().await, Some(Job::Connect { reset_link: true }));
        assert_eq!(agent.link.resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn api_bind_failure_is_a_generic_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut agent, led) = agent(Arc::new(MemoryStore::new()), FakeLink::default(), vec![], vec![]);
        agent.api = ApiServer::new(occupied.local_addr().unwrap(), agent.state.clone());

        agent.start().await;
        agent.step().await;
        tokio::time::advance(Duration::from_millis(10_000)).await;
        assert_eq!(agent.step().await, Some(Job::StartApi));

        assert_eq!(*led.borrow(), StatusSignal::Error(ErrorClass::Generic));
        assert_eq!(phase(&agent).await, Phase::Booting);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_with_link_down_reenters_bootstrap() {
        let (mut agent, led) = agent(
            Arc::new(MemoryStore::with_entries([(KEY_SSID, "net")])),
            FakeLink::default(),
            vec![Ok(19.0), Ok(19.5)],
            vec![Err(RelayFailure::Transport("connection reset".into()))],
        );
        agent.start().await;
        agent.step().await;
        tokio::time::advance(Duration::from_millis(10_000)).await;
        agent.step().await;

        agent.link.up = false;
        assert_eq!(agent.step().await, Some(Job::Tick));

        assert_eq!(*led.borrow(), StatusSignal::Error(ErrorClass::Connectivity));
        assert_eq!(phase(&agent).await, Phase::Errored(FaultKind::Connectivity));
        assert_eq!(agent.step().await, Some(Job::Connect { reset_link: true }));

        // sensing continues while reconnecting, without actuation
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(agent.step().await, Some(Job::Tick));
        assert_eq!(agent.relay.calls.lock().unwrap().len(), 1);
        assert_eq!(agent.state.machine.lock().await.last_reading_c(), Some(19.5));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_with_link_up_is_an_actuator_error() {
        let (mut agent, led) = agent(
            Arc::new(MemoryStore::new()),
            FakeLink::default(),
            vec![Ok(19.0)],
            vec![Err(RelayFailure::Transport("connection refused".into()))],
        );
        agent.start().await;
        agent.step().await;
        tokio::time::advance(Duration::from_millis(10_000)).await;
        agent.step().await;
        agent.step().await;

        assert_eq!(*led.borrow(), StatusSignal::Error(ErrorClass::Actuator));
        assert_eq!(phase(&agent).await, Phase::Errored(FaultKind::Actuator));
        assert!(!agent.state.machine.lock().await.is_bootstrapping());
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_skips_the_relay() {
        let (mut agent, led) = agent(
            Arc::new(MemoryStore::new()),
            FakeLink::default(),
            vec![Err(SensorError::ShortRead { len: 2 })],
            vec![],
        );
        agent.start().await;
        agent.step().await;
        tokio::time::advance(Duration::from_millis(10_000)).await;
        agent.step().await;
        agent.step().await;

        assert_eq!(*led.borrow(), StatusSignal::Error(ErrorClass::Sensor));
        assert!(agent.relay.calls.lock().unwrap().is_empty());
        assert!(agent.state.last_reading_epoch.lock().await.is_none());
    }

    #[test]
    fn json_store_writes_through() {
        let dir = std::env::temp_dir().join(format!("thermorelay-store-{}", std::process::id()));
        let path = dir.join("config.json");
        let _ = std::fs::remove_file(&path);

        let store = JsonFileStore::open(path.clone()).unwrap();
        assert_eq!(store.get(KEY_TEMP_LIMIT).unwrap(), None);
        store.set(KEY_TEMP_LIMIT, "21.5").unwrap();

        let reopened = JsonFileStore::open(path.clone()).unwrap();
        assert_eq!(reopened.get(KEY_TEMP_LIMIT).unwrap(), Some("21.5".to_string()));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn simulated_sensor_decodes_through_frame_path() {
        let mut sensor = SimulatedSht30::new(20.0);

        let first = sensor.measure().await.unwrap();
        let second = sensor.measure().await.unwrap();

        assert!((first - 20.25).abs() < 0.01, "{first}");
        assert!((second - 20.5).abs() < 0.01, "{second}");
    }
}
