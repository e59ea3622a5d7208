pub mod blink;
pub mod config;
pub mod control;
pub mod error;
pub mod relay;
pub mod sht30;
pub mod store;
pub mod types;

pub use blink::{BlinkEncoder, BlinkMode, BlinkStep, BlinkTiming};
pub use config::{AgentConfig, Credentials, RelayEndpoint, TimingConfig};
pub use control::{Agenda, ControlAction, ControlMachine, DeviceState, Job};
pub use error::{LimitError, NetworkError, RelayFailure, SensorError, StoreError};
pub use relay::{RelayDeadline, RelayOutcome, RelayResponse};
pub use store::{ConfigStore, MemoryStore};
pub use types::{
    ErrorClass, FaultKind, LimitView, Phase, RelayCommand, StatusSignal, StatusView, TempView,
};
