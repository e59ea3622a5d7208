use core::convert::TryInto;
use std::{
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::BLOCK,
    gpio::{AnyOutputPin, InputPin, Output, OutputPin, PinDriver},
    i2c::{I2c, I2cConfig, I2cDriver},
    peripheral::Peripheral,
    prelude::Peripherals,
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use thermorelay_common::{
    config::{format_limit, KEY_TEMP_LIMIT},
    sht30, AgentConfig, BlinkEncoder, BlinkTiming, ConfigStore, ControlAction, ControlMachine,
    Credentials, Job, LimitView, NetworkError, RelayCommand, RelayDeadline, RelayEndpoint,
    RelayFailure, RelayOutcome, RelayResponse, SensorError, StatusSignal, StoreError, TempView,
    TimingConfig,
};

const NVS_NAMESPACE: &str = "thermorelay";
const NVS_VALUE_MAX: usize = 128;
const STATUS_LED_PIN: i32 = 2;
const I2C_BAUDRATE_HZ: u32 = 100_000;
const RELAY_CHUNK_SIZE: usize = 256;
const HELLO_HTML: &str = "<h1>Hello world</h1>";
const NOT_FOUND_HTML: &str = "404 Not Found";
const LIMIT_ROUTE_PREFIX: &str = "/temp/limit/";

type Request<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

#[derive(Clone)]
struct SharedState {
    machine: Arc<Mutex<ControlMachine>>,
    store: Arc<NvsStore>,
    last_reading_epoch: Arc<Mutex<Option<i64>>>,
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Mutex<()>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = Arc::new(NvsStore {
        partition: nvs_partition.clone(),
        lock: Mutex::new(()),
    });

    let mut config = AgentConfig::load(store.as_ref()).context("failed to read NVS config")?;
    ensure_wifi_defaults(&mut config);
    info!(
        "NVS config loaded: ssid=`{}`, relay=`{}`, limit={}",
        config.credentials.ssid,
        config.relay.host_header(),
        config.limit_c
    );
    if !config.has_credentials() {
        warn!("no WiFi SSID in NVS or build env; bootstrap will keep failing");
    }

    let Peripherals {
        modem, i2c0, pins, ..
    } = Peripherals::take()?;

    let sensor = Sht30Sensor::new(i2c0, pins.gpio21, pins.gpio22)
        .context("failed to initialize SHT30 bus")?;
    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let link = WifiLink {
        wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
    };

    let timing = TimingConfig::default();
    let relay = EspRelayClient {
        endpoint: config.relay.clone(),
        deadline: RelayDeadline::new(Duration::from_millis(timing.relay_timeout_ms)),
    };
    let led = spawn_status_led(init_status_led(STATUS_LED_PIN), BlinkTiming::default())?;

    let state = SharedState {
        machine: Arc::new(Mutex::new(ControlMachine::new(timing, config.limit_c))),
        store,
        last_reading_epoch: Arc::new(Mutex::new(None)),
    };

    let mut agent = Agent {
        state,
        link,
        sensor,
        relay,
        server: None,
        sntp: None,
        led,
        credentials: config.credentials,
    };
    agent.run()
}

fn ensure_wifi_defaults(config: &mut AgentConfig) {
    if config.credentials.ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.credentials.ssid = ssid.to_string();
        }
    }

    if config.credentials.password.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.credentials.password = pass.to_string();
        }
    }
}

fn http_port() -> u16 {
    option_env!("AGENT_HTTP_PORT")
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(80)
}

struct Agent {
    state: SharedState,
    link: WifiLink,
    sensor: Sht30Sensor,
    relay: EspRelayClient,
    server: Option<EspHttpServer<'static>>,
    sntp: Option<EspSntp<'static>>,
    led: mpsc::Sender<StatusSignal>,
    credentials: Credentials,
}

impl Agent {
    fn run(&mut self) -> ! {
        lock(&self.state.machine).start(monotonic_ms());

        loop {
            let now_ms = monotonic_ms();
            let job = lock(&self.state.machine).poll(now_ms);

            match job {
                Some(Job::Connect { reset_link }) => self.connect(reset_link),
                Some(Job::StartApi) => self.start_api(),
                Some(Job::Tick) => self.tick(),
                None => {
                    let machine = lock(&self.state.machine);
                    let wait_ms = machine
                        .next_deadline()
                        .map(|due_ms| due_ms.saturating_sub(now_ms))
                        .unwrap_or(machine.timing.retry_interval_ms);
                    drop(machine);
                    thread::sleep(Duration::from_millis(wait_ms));
                }
            }
        }
    }

    fn connect(&mut self, reset_link: bool) {
        if reset_link {
            info!("resetting wifi before reconnect");
            self.link.reset();
        }

        info!("wifi connecting to `{}`", self.credentials.ssid);
        let result = self.link.connect(&self.credentials);
        match &result {
            Ok(()) => info!("wifi connected and netif up"),
            Err(err) => warn!("wifi connect failed: {err}"),
        }

        let actions = lock(&self.state.machine).on_associated(result, monotonic_ms());
        self.execute(actions);
    }

    fn start_api(&mut self) {
        // the previous listener must release the port first
        self.server = None;
        let result = match create_http_server(self.state.clone()) {
            Ok(server) => {
                info!("local api listening on port {}", http_port());
                self.server = Some(server);
                Ok(())
            }
            Err(err) => {
                warn!("local api start failed: {err:#}");
                Err(NetworkError::Failed(format!("{err:#}")))
            }
        };

        if result.is_ok() && self.sntp.is_none() {
            match EspSntp::new_default() {
                Ok(sntp) => self.sntp = Some(sntp),
                Err(err) => warn!("failed to start SNTP: {err}"),
            }
        }

        let actions = lock(&self.state.machine).on_api_started(result, monotonic_ms());
        self.execute(actions);
    }

    fn tick(&mut self) {
        let reading = self.sensor.measure();
        match &reading {
            Ok(temp_c) => {
                info!("[SHT30] Temperature: {temp_c:.2}°C");
                *lock(&self.state.last_reading_epoch) = Some(Utc::now().timestamp());
            }
            Err(err) => warn!("SHT30 measurement failed: {err}"),
        }

        let actions = lock(&self.state.machine).on_reading(reading, monotonic_ms());
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<ControlAction>) {
        let mut pending = actions;
        while !pending.is_empty() {
            let mut follow_up = Vec::new();
            for action in pending {
                match action {
                    ControlAction::Signal(signal) => {
                        if self.led.send(signal).is_err() {
                            warn!("status LED thread is gone");
                        }
                    }
                    ControlAction::Actuate(command) => {
                        let outcome = self.actuate(command);
                        let mut machine = lock(&self.state.machine);
                        follow_up.extend(machine.on_relay_outcome(&outcome, monotonic_ms()));
                        info!("device phase {}", machine.phase().as_str());
                    }
                }
            }
            pending = follow_up;
        }
    }

    fn actuate(&self, command: RelayCommand) -> RelayOutcome {
        info!("relay GET {}", command.path());
        let outcome = match self.relay.call(command) {
            Err(RelayFailure::Transport(reason)) if !self.link.is_connected() => {
                warn!("relay transport failed with wifi down: {reason}");
                Err(RelayFailure::LinkDown)
            }
            outcome => outcome,
        };

        match &outcome {
            Ok(body) => info!("relay acknowledged `{}` ({} bytes)", command.as_str(), body.len()),
            Err(err) => warn!("relay call `{}` failed: {err}", command.as_str()),
        }
        outcome
    }
}

struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiLink {
    fn connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        if credentials.ssid.trim().is_empty() {
            return Err(NetworkError::Failed("wifi credentials missing".to_string()));
        }

        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| NetworkError::Failed("wifi ssid too long".to_string()))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| NetworkError::Failed("wifi password too long".to_string()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(|err| NetworkError::Failed(err.to_string()))?;

        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi
                .start()
                .map_err(|err| NetworkError::Failed(err.to_string()))?;
        }

        self.wifi
            .connect()
            .map_err(|err| NetworkError::Failed(err.to_string()))?;
        // association succeeded but the interface never came up
        self.wifi
            .wait_netif_up()
            .map_err(|_| NetworkError::NotConnected)?;
        Ok(())
    }

    fn reset(&mut self) {
        let _ = self.wifi.disconnect();
        let _ = self.wifi.stop();
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }
}

struct Sht30Sensor {
    i2c: I2cDriver<'static>,
    address: u8,
}

impl Sht30Sensor {
    fn new<I: I2c>(
        i2c: impl Peripheral<P = I> + 'static,
        sda: impl Peripheral<P = impl InputPin + OutputPin> + 'static,
        scl: impl Peripheral<P = impl InputPin + OutputPin> + 'static,
    ) -> anyhow::Result<Self> {
        let config = I2cConfig::new().baudrate(Hertz(I2C_BAUDRATE_HZ));
        let i2c = I2cDriver::new(i2c, sda, scl, &config)?;
        Ok(Self {
            i2c,
            address: sht30::DEFAULT_ADDRESS,
        })
    }

    fn measure(&mut self) -> Result<f32, SensorError> {
        self.i2c
            .write(self.address, &sht30::MEASURE_COMMAND, BLOCK)
            .map_err(|err| {
                warn!("SHT30 command write failed: {err}");
                SensorError::WriteFailed { written: 0 }
            })?;

        let mut frame = [0_u8; sht30::FRAME_LEN];
        self.i2c
            .read(self.address, &mut frame, BLOCK)
            .map_err(|err| SensorError::Bus(err.to_string()))?;
        sht30::decode_temperature(&frame)
    }
}

struct EspRelayClient {
    endpoint: RelayEndpoint,
    deadline: RelayDeadline,
}

impl EspRelayClient {
    fn call(&self, command: RelayCommand) -> RelayOutcome {
        let started = Instant::now();
        let conf = HttpClientConfiguration {
            timeout: Some(self.deadline.io_timeout()),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&conf)
            .map_err(|err| RelayFailure::Transport(err.to_string()))?;
        let mut client = HttpClient::wrap(connection);

        let url = self.endpoint.url(command);
        let host = self.endpoint.host_header();
        let headers = [("Host", host.as_str()), ("Connection", "close")];

        let op_started = Instant::now();
        let request = client
            .request(Method::Get, &url, &headers)
            .map_err(|err| {
                self.deadline
                    .failure(op_started.elapsed(), started.elapsed(), format!("{err:?}"))
            })?;
        let op_started = Instant::now();
        let mut response = request.submit().map_err(|err| {
            self.deadline
                .failure(op_started.elapsed(), started.elapsed(), format!("{err:?}"))
        })?;

        let mut body = RelayResponse::accept(response.status())?;
        let mut chunk = [0_u8; RELAY_CHUNK_SIZE];
        loop {
            if self.deadline.remaining(started.elapsed()).is_none() {
                return Err(RelayFailure::Timeout);
            }
            let op_started = Instant::now();
            let read = response.read(&mut chunk).map_err(|err| {
                self.deadline
                    .failure(op_started.elapsed(), started.elapsed(), format!("{err:?}"))
            })?;
            if read == 0 {
                break;
            }
            body.push_chunk(&chunk[..read]);
        }
        Ok(body.finish())
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: http_port(),
        stack_size: 8 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/hello", Method::Get, move |req| {
        write_html(req, 200, HELLO_HTML)
    })?;

    {
        let state = state.clone();
        server.fn_handler("/temp", Method::Get, move |req| {
            let t = lock(&state.machine).last_reading_c();
            write_json(req, &TempView { t })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/temp/limit", Method::Get, move |req| {
            let limit = lock(&state.machine).limit_c();
            write_json(req, &LimitView { limit })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/temp/limit/*", Method::Get, move |req| {
            let raw = limit_from_uri(req.uri()).to_string();
            let limit = match ControlMachine::validate_limit(&raw) {
                Ok(limit) => limit,
                Err(err) => {
                    warn!("rejected limit update: {err}");
                    req.into_status_response(400)?;
                    return Ok(());
                }
            };

            let mut machine = lock(&state.machine);
            if let Err(err) = state.store.set(KEY_TEMP_LIMIT, &format_limit(limit)) {
                warn!("failed to persist limit: {err}");
                drop(machine);
                return write_error(req, 500, "failed to persist limit");
            }
            machine.commit_limit(limit);
            drop(machine);
            info!("temperature limit set to {limit}");
            write_json(req, &LimitView { limit })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/status", Method::Get, move |req| {
            let last_reading_epoch = *lock(&state.last_reading_epoch);
            let status = lock(&state.machine).status(last_reading_epoch);
            write_json(req, &status)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
        write_html(req, 404, NOT_FOUND_HTML)
    })?;

    Ok(server)
}

fn limit_from_uri(uri: &str) -> &str {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    path.strip_prefix(LIMIT_ROUTE_PREFIX).unwrap_or_default()
}

fn write_html(req: Request<'_, '_>, status_code: u16, body: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/html; charset=utf-8")],
    )?
    .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(req: Request<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: Request<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl ConfigStore for NvsStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        let mut buffer = [0_u8; NVS_VALUE_MAX];

        nvs.get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| StoreError::Io(format!("{key}: {err}")))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Io(err.to_string()))?;
        nvs.set_str(key, value)
            .map_err(|err| StoreError::Io(format!("{key}: {err}")))
    }
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn drive_status_led(status_led: &mut Option<StatusLed>, lit: bool) {
    let Some(led) = status_led.as_mut() else {
        return;
    };

    if led.lit == lit {
        return;
    }

    let result = if lit {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = lit;
    }
}

/// The LED thread owns the encoder; `recv_timeout` is its one timer, so a
/// pattern switch cancels the pending wait by construction.
fn spawn_status_led(
    mut status_led: Option<StatusLed>,
    timing: BlinkTiming,
) -> anyhow::Result<mpsc::Sender<StatusSignal>> {
    let (tx, rx) = mpsc::channel::<StatusSignal>();

    thread::Builder::new()
        .name("status-led".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut encoder = BlinkEncoder::new(timing);
            encoder.apply(StatusSignal::Ok);
            let step = encoder.advance();
            drive_status_led(&mut status_led, step.level);
            let mut deadline = Instant::now() + Duration::from_millis(step.hold_ms);

            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(signal) => {
                        if !encoder.apply(signal) {
                            continue;
                        }
                        info!("status LED code {:?}", encoder.mode().code());
                        drive_status_led(&mut status_led, false);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                let step = encoder.advance();
                drive_status_led(&mut status_led, step.level);
                deadline = Instant::now() + Duration::from_millis(step.hold_ms);
            }

            drive_status_led(&mut status_led, false);
        })
        .context("failed to spawn status LED thread")?;

    Ok(tx)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
