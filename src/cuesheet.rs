//! Expansion of the experiment parameter space into the shared timeline.
//!
//! Every station builds its cuesheet independently from the same
//! [`ExperimentConfig`], so the loop nesting below (frequency, bandwidth,
//! spread factor, coding rate, power, payload size, sender) fixes the
//! timing of every scenario and must never be reordered.

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::{Bandwidth, ExperimentConfig, Station};
use crate::radio::LoraConfig;

/// One timed window with a fixed radio configuration and a single sender.
/// `start` and `end` are seconds after the experiment start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub start: u64,
    pub end: u64,
    /// Seconds between two transmissions.
    pub between: u64,
    pub freq: f64,
    pub bw: Bandwidth,
    pub sf: u8,
    pub cr: u8,
    pub pow: i32,
    pub size: usize,
    pub sender: Station,
}

impl Scenario {
    /// Tag shared by all events logged for this scenario's radio settings.
    /// The frequency always carries a decimal point (`915.0`, not `915`).
    pub fn fingerprint(&self) -> String {
        format!("{:?},{},{},{},{}", self.freq, self.bw, self.sf, self.cr, self.pow)
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig::for_experiment(self.bw, self.sf, self.cr, self.freq, self.pow)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cuesheet {
    scenarios: VecDeque<Scenario>,
    permutations: usize,
    total_secs: u64,
}

impl Cuesheet {
    /// Number of distinct radio configurations.
    pub fn permutations(&self) -> usize {
        self.permutations
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Span of the whole experiment, end padding of the last case included.
    pub fn total_secs(&self) -> u64 {
        self.total_secs
    }

    pub fn hours(&self) -> f64 {
        self.total_secs as f64 / (60.0 * 60.0)
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.iter()
    }

    pub fn pop_front(&mut self) -> Option<Scenario> {
        self.scenarios.pop_front()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} permutations {} tests, {} hours",
            self.permutations,
            self.scenarios.len(),
            self.hours()
        )
    }
}

/// Hand-built timelines for scheduler tests. Only the scenarios are
/// meaningful; `permutations` and `total_secs` are not derived.
#[cfg(test)]
impl From<Vec<Scenario>> for Cuesheet {
    fn from(scenarios: Vec<Scenario>) -> Self {
        let total_secs = scenarios.last().map(|s| s.end).unwrap_or(0);
        Self {
            scenarios: scenarios.into(),
            permutations: 0,
            total_secs,
        }
    }
}

/// Build the full timeline. The running cursor advances by one test case
/// duration per (payload size, sender) pair; 3/4 of the padding goes before
/// the active window to let the radio settle and 1/4 after it to absorb
/// clock skew between stations.
pub fn build_cuesheet(config: &ExperimentConfig) -> Cuesheet {
    let start_padding = config.test_case_padding * 3 / 4;
    let end_padding = config.test_case_padding / 4;

    let mut scenarios = VecDeque::new();
    let mut permutations = 0;
    let mut t = 0;

    for &freq in &config.frequency {
        for &bw in &config.bandwidth {
            for &sf in &config.spread_factor {
                for &cr in &config.coding_rate {
                    for &pow in &config.power {
                        permutations += 1;
                        for &size in &config.payload_size {
                            for &sender in &config.stations {
                                let end_t = t + config.test_case_duration;
                                scenarios.push_back(Scenario {
                                    start: t + start_padding,
                                    end: end_t - end_padding,
                                    between: config.transmission_padding,
                                    freq,
                                    bw,
                                    sf,
                                    cr,
                                    pow,
                                    size,
                                    sender,
                                });
                                t = end_t;
                            }
                        }
                    }
                }
            }
        }
    }

    let cuesheet = Cuesheet {
        scenarios,
        permutations,
        total_secs: t,
    };
    log::info!("{}", cuesheet.summary());
    cuesheet
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ExperimentConfig {
        ExperimentConfig {
            test_case_duration: 600,
            test_case_padding: 60,
            transmission_padding: 2,
            frequency: vec![915.1, 916.0],
            bandwidth: vec![Bandwidth::Khz125, Bandwidth::Khz250],
            spread_factor: vec![7, 9, 12],
            coding_rate: vec![5],
            payload_size: vec![40, 100],
            power: vec![22],
            start_at: 5,
            stations: vec![Station::A, Station::B, Station::C],
        }
    }

    #[test]
    fn groups_follow_outer_axes() {
        let config = small_config();
        let cuesheet = build_cuesheet(&config);
        let inner = config.payload_size.len() * config.stations.len();

        assert_eq!(cuesheet.permutations(), 2 * 2 * 3);
        assert_eq!(cuesheet.len(), cuesheet.permutations() * inner);

        let scenarios: Vec<&Scenario> = cuesheet.scenarios().collect();
        for group in scenarios.chunks(inner) {
            let radio = group[0].fingerprint();
            assert!(group.iter().all(|s| s.fingerprint() == radio));
            assert!(group.windows(2).all(|w| w[0].start < w[1].start));
        }
    }

    #[test]
    fn loop_nesting_order() {
        let cuesheet = build_cuesheet(&small_config());
        let first: Vec<(usize, Station)> = cuesheet
            .scenarios()
            .take(6)
            .map(|s| (s.size, s.sender))
            .collect();
        assert_eq!(
            first,
            vec![
                (40, Station::A),
                (40, Station::B),
                (40, Station::C),
                (100, Station::A),
                (100, Station::B),
                (100, Station::C),
            ]
        );

        let seventh = cuesheet.scenarios().nth(6).unwrap();
        assert_eq!((seventh.freq, seventh.bw, seventh.sf), (915.1, Bandwidth::Khz125, 9));

        let last = cuesheet.scenarios().last().unwrap();
        assert_eq!((last.freq, last.bw, last.sf), (916.0, Bandwidth::Khz250, 12));
    }

    #[test]
    fn windows_are_padded_asymmetrically() {
        let config = small_config();
        let cuesheet = build_cuesheet(&config);

        for (i, scenario) in cuesheet.scenarios().enumerate() {
            let window_start = i as u64 * config.test_case_duration;
            assert_eq!(scenario.start - window_start, 45);
            assert_eq!(
                scenario.end - scenario.start,
                config.test_case_duration - config.test_case_padding
            );
            assert_eq!(scenario.between, 2);
        }

        let scenarios: Vec<&Scenario> = cuesheet.scenarios().collect();
        assert!(scenarios.windows(2).all(|w| w[0].end < w[1].start));
    }

    #[test]
    fn total_span_matches_last_window() {
        let config = small_config();
        let cuesheet = build_cuesheet(&config);
        let last = cuesheet.scenarios().last().unwrap();

        assert_eq!(last.end + config.test_case_padding / 4, cuesheet.total_secs());
        assert_eq!(cuesheet.total_secs(), cuesheet.len() as u64 * 600);
        assert_eq!(cuesheet.hours(), 72.0 * 600.0 / 3600.0);
    }

    #[test]
    fn uneven_padding_floors_both_sides() {
        let config = ExperimentConfig {
            test_case_duration: 30,
            test_case_padding: 10,
            frequency: vec![915.1],
            bandwidth: vec![Bandwidth::Khz125],
            spread_factor: vec![7],
            coding_rate: vec![5],
            stations: vec![Station::A],
            ..small_config()
        };
        let cuesheet = build_cuesheet(&config);
        let first = cuesheet.scenarios().next().unwrap();
        assert_eq!((first.start, first.end), (7, 28));
    }

    #[test]
    fn empty_axis_yields_empty_cuesheet() {
        let config = ExperimentConfig {
            spread_factor: vec![],
            ..small_config()
        };
        let cuesheet = build_cuesheet(&config);
        assert!(cuesheet.is_empty());
        assert_eq!(cuesheet.permutations(), 0);
        assert_eq!(cuesheet.total_secs(), 0);
    }

    #[test]
    fn pops_in_timeline_order() {
        let mut cuesheet = build_cuesheet(&small_config());
        let mut last_start = None;
        while let Some(scenario) = cuesheet.pop_front() {
            if let Some(prev) = last_start {
                assert!(scenario.start > prev);
            }
            last_start = Some(scenario.start);
        }
        assert!(cuesheet.is_empty());
    }

    #[test]
    fn fingerprint_lists_radio_parameters() {
        let cuesheet = build_cuesheet(&small_config());
        let first = cuesheet.scenarios().next().unwrap();
        assert_eq!(first.fingerprint(), "915.1,125,7,5,22");

        let whole_mhz = Scenario {
            freq: 915.0,
            bw: Bandwidth::Khz62,
            pow: -3,
            ..first.clone()
        };
        assert_eq!(whole_mhz.fingerprint(), "915.0,62,7,5,-3");
    }

    #[test]
    fn summary_line() {
        let cuesheet = build_cuesheet(&small_config());
        assert_eq!(cuesheet.summary(), "12 permutations 72 tests, 12 hours");
    }
}
