use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    Connectivity,
    Sensor,
    Actuator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Booting,
    Running,
    Errored(FaultKind),
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::Running => "RUNNING",
            Self::Errored(FaultKind::Connectivity) => "ERROR_CONNECTIVITY",
            Self::Errored(FaultKind::Sensor) => "ERROR_SENSOR",
            Self::Errored(FaultKind::Actuator) => "ERROR_ACTUATOR",
        }
    }

    pub fn is_errored(self) -> bool {
        matches!(self, Self::Errored(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Connectivity,
    Actuator,
    Sensor,
    Generic,
}

impl ErrorClass {
    pub fn code(self) -> u8 {
        match self {
            Self::Connectivity => 2,
            Self::Actuator => 3,
            Self::Sensor => 4,
            Self::Generic => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Ok,
    Error(ErrorClass),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    On,
    Off,
}

impl RelayCommand {
    // no dead-band
    pub fn for_reading(reading_c: f32, limit_c: f32) -> Self {
        if reading_c < limit_c {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Self::On => "/on",
            Self::Off => "/off",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TempView {
    pub t: Option<f32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LimitView {
    pub limit: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusView {
    pub phase: &'static str,
    pub limit: f32,
    pub t: Option<f32>,
    #[serde(rename = "ledCode")]
    pub led_code: Option<u8>,
    #[serde(rename = "lastReadingEpoch")]
    pub last_reading_epoch: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reading_equal_to_limit_switches_off() {
        assert_eq!(RelayCommand::for_reading(17.9, 18.0), RelayCommand::On);
        assert_eq!(RelayCommand::for_reading(18.0, 18.0), RelayCommand::Off);
        assert_eq!(RelayCommand::for_reading(22.0, 18.0), RelayCommand::Off);
    }

    #[test]
    fn error_codes_are_distinct() {
        let codes: Vec<u8> = [
            ErrorClass::Connectivity,
            ErrorClass::Actuator,
            ErrorClass::Sensor,
            ErrorClass::Generic,
        ]
        .into_iter()
        .map(ErrorClass::code)
        .collect();

        assert_eq!(codes, vec![2, 3, 4, 5]);
    }

    #[test]
    fn temp_view_serializes_missing_reading_as_null() {
        let body = serde_json::to_string(&TempView { t: None }).unwrap();
        assert_eq!(body, r#"{"t":null}"#);
    }
}
