use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::{ModjamError, Result};

// ---------------------------------------------------------------------------
// Bandwidth
// ---------------------------------------------------------------------------

/// LoRa channel bandwidth. `Khz62` is 62.5 kHz; the node firmware takes the
/// truncated value 62 as its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u32")]
pub enum Bandwidth {
    Khz62,
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub const ALL: [Bandwidth; 4] = [Self::Khz62, Self::Khz125, Self::Khz250, Self::Khz500];

    /// Value written into the node's LoRa settings.
    pub fn code(self) -> u32 {
        match self {
            Self::Khz62 => 62,
            Self::Khz125 => 125,
            Self::Khz250 => 250,
            Self::Khz500 => 500,
        }
    }

    pub fn hz(self) -> f64 {
        match self {
            Self::Khz62 => 62_500.0,
            Self::Khz125 => 125_000.0,
            Self::Khz250 => 250_000.0,
            Self::Khz500 => 500_000.0,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|bw| bw.code() == code)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "62" | "62.5" => Some(Self::Khz62),
            "125" => Some(Self::Khz125),
            "250" => Some(Self::Khz250),
            "500" => Some(Self::Khz500),
            _ => None,
        }
    }

    pub fn all_names() -> &'static [&'static str] {
        &["62", "125", "250", "500"]
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl From<Bandwidth> for u32 {
    fn from(bw: Bandwidth) -> u32 {
        bw.code()
    }
}

// ---------------------------------------------------------------------------
// Station
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Station {
    A,
    B,
    C,
    D,
}

impl Station {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            _ => None,
        }
    }

    pub fn all_names() -> &'static [&'static str] {
        &["A", "B", "C", "D"]
    }
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Experiment configuration
// ---------------------------------------------------------------------------

pub const SPREAD_FACTORS: [u8; 8] = [5, 6, 7, 8, 9, 10, 11, 12];
pub const CODING_RATES: [u8; 4] = [5, 6, 7, 8];

/// The parameter space every station expands into the same cuesheet.
/// Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentConfig {
    /// Total duration of each test case, padding included.
    pub test_case_duration: u64,
    /// Idle time between the active parts of two test cases.
    pub test_case_padding: u64,
    /// Pause between two transmissions of the sending station.
    pub transmission_padding: u64,
    /// Center frequencies in MHz.
    pub frequency: Vec<f64>,
    pub bandwidth: Vec<Bandwidth>,
    pub spread_factor: Vec<u8>,
    /// Coding rate denominators (4/5 .. 4/8).
    pub coding_rate: Vec<u8>,
    /// Total payload sizes in bytes.
    pub payload_size: Vec<usize>,
    /// Transmit power in dBm.
    pub power: Vec<i32>,
    /// Start on the next wall-clock minute that is a multiple of this.
    pub start_at: u32,
    pub stations: Vec<Station>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            test_case_duration: 600,
            test_case_padding: 60,
            transmission_padding: 2,
            frequency: vec![915.1],
            bandwidth: Bandwidth::ALL.to_vec(),
            spread_factor: SPREAD_FACTORS.to_vec(),
            coding_rate: CODING_RATES.to_vec(),
            payload_size: vec![40],
            power: vec![22],
            start_at: 5,
            stations: vec![Station::A, Station::B],
        }
    }
}

impl ExperimentConfig {
    /// Replace every empty axis with its default values.
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.frequency.is_empty() {
            self.frequency = defaults.frequency;
        }
        if self.bandwidth.is_empty() {
            self.bandwidth = defaults.bandwidth;
        }
        if self.spread_factor.is_empty() {
            self.spread_factor = defaults.spread_factor;
        }
        if self.coding_rate.is_empty() {
            self.coding_rate = defaults.coding_rate;
        }
        if self.payload_size.is_empty() {
            self.payload_size = defaults.payload_size;
        }
        if self.power.is_empty() {
            self.power = defaults.power;
        }
        if self.stations.is_empty() {
            self.stations = defaults.stations;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.test_case_padding >= self.test_case_duration {
            return Err(ModjamError::Config(format!(
                "test case padding ({}s) must be shorter than the test case duration ({}s)",
                self.test_case_padding, self.test_case_duration
            )));
        }
        if self.start_at == 0 || self.start_at > 60 {
            return Err(ModjamError::Config(format!(
                "start-at must be between 1 and 60 minutes, got {}",
                self.start_at
            )));
        }
        if let Some(sf) = self.spread_factor.iter().find(|sf| !SPREAD_FACTORS.contains(sf)) {
            return Err(ModjamError::Config(format!("unsupported spread factor {}", sf)));
        }
        if let Some(cr) = self.coding_rate.iter().find(|cr| !CODING_RATES.contains(cr)) {
            return Err(ModjamError::Config(format!("unsupported coding rate {}", cr)));
        }
        Ok(())
    }
}

/// Per-station settings that are not part of the shared parameter space.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub this_station: Station,
    /// Device path of a hardware node. Only the emulated node (`None`) is
    /// supported.
    pub port: Option<String>,
    pub log_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_axes_take_defaults() {
        let config = ExperimentConfig {
            frequency: vec![868.0],
            bandwidth: vec![],
            spread_factor: vec![7],
            coding_rate: vec![],
            payload_size: vec![],
            power: vec![10, 20],
            stations: vec![],
            ..ExperimentConfig::default()
        }
        .with_defaults();

        assert_eq!(config.frequency, vec![868.0]);
        assert_eq!(config.bandwidth, Bandwidth::ALL.to_vec());
        assert_eq!(config.spread_factor, vec![7]);
        assert_eq!(config.coding_rate, vec![5, 6, 7, 8]);
        assert_eq!(config.payload_size, vec![40]);
        assert_eq!(config.power, vec![10, 20]);
        assert_eq!(config.stations, vec![Station::A, Station::B]);
    }

    #[test]
    fn padding_must_fit_inside_the_case() {
        let config = ExperimentConfig {
            test_case_duration: 60,
            test_case_padding: 60,
            ..ExperimentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ModjamError::Config(_))));
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_modulation() {
        let config = ExperimentConfig {
            spread_factor: vec![7, 13],
            ..ExperimentConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ExperimentConfig {
            coding_rate: vec![4],
            ..ExperimentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bandwidth_names_and_codes() {
        assert_eq!(Bandwidth::from_name("62.5"), Some(Bandwidth::Khz62));
        assert_eq!(Bandwidth::from_name("62"), Some(Bandwidth::Khz62));
        assert_eq!(Bandwidth::from_name("100"), None);
        assert_eq!(Bandwidth::Khz62.code(), 62);
        assert_eq!(Bandwidth::Khz62.hz(), 62_500.0);
        assert_eq!(Bandwidth::from_code(250), Some(Bandwidth::Khz250));
        assert_eq!(Bandwidth::from_code(62), Some(Bandwidth::Khz62));
    }

    #[test]
    fn config_serializes_with_plain_values() {
        let json = serde_json::to_value(ExperimentConfig::default()).unwrap();
        assert_eq!(json["bandwidth"], serde_json::json!([62, 125, 250, 500]));
        assert_eq!(json["stations"], serde_json::json!(["A", "B"]));
    }

    #[test]
    fn station_parsing_is_case_insensitive() {
        assert_eq!(Station::from_name("c"), Some(Station::C));
        assert_eq!(Station::from_name("E"), None);
        assert_eq!(Station::D.to_string(), "D");
    }
}
