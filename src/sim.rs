//! In-process LoRa node.
//!
//! Behaves like a node attached over a serial port as far as the scheduler
//! can tell: settings are written inside a transaction and the node reboots
//! on commit, queued packets get random ids, and every transmission is
//! reported through firmware-style status lines once its airtime elapses.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::Bandwidth;
use crate::error::RadioError;
use crate::radio::{LoraConfig, Radio, RadioEvent};

/// Preamble length used by the node firmware, in symbols.
const PREAMBLE_SYMBOLS: f64 = 16.0;

/// Mean delay between queueing a packet and the radio keying up.
const QUEUE_DELAY_MS: f64 = 40.0;
const QUEUE_JITTER_MS: f64 = 10.0;

/// LoRa time on air in milliseconds for an explicit-header packet with CRC.
pub fn time_on_air_ms(config: &LoraConfig, payload_bytes: usize) -> u32 {
    let sf = config.spread_factor as f64;
    let bw_hz = Bandwidth::from_code(config.bandwidth)
        .map(Bandwidth::hz)
        .unwrap_or(config.bandwidth as f64 * 1000.0);
    let symbol_secs = 2.0_f64.powf(sf) / bw_hz;

    // Low data rate optimisation kicks in once a symbol exceeds 16 ms.
    let de = if symbol_secs > 0.016 { 1.0 } else { 0.0 };
    let h = 0.0;
    let crc = 1.0;

    let t_preamble = (PREAMBLE_SYMBOLS + 4.25) * symbol_secs;
    let num = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0 + 16.0 * crc - 20.0 * h;
    let denom = 4.0 * (sf - 2.0 * de);
    let n_payload = 8.0 + ((num / denom).ceil() * config.coding_rate as f64).max(0.0);
    let t_payload = n_payload * symbol_secs;

    ((t_preamble + t_payload) * 1000.0).round() as u32
}

pub struct SimRadio {
    device_path: String,
    connected: bool,
    node_ready: bool,
    settings: LoraConfig,
    staged: Option<LoraConfig>,
    events: UnboundedSender<RadioEvent>,
    fail_next: Option<RadioError>,
}

impl SimRadio {
    /// A node straight out of the box: preset modulation, idle at boot.
    pub fn new(device_path: impl Into<String>, events: UnboundedSender<RadioEvent>) -> Self {
        Self {
            device_path: device_path.into(),
            connected: false,
            node_ready: false,
            settings: LoraConfig {
                bandwidth: 250,
                spread_factor: 11,
                coding_rate: 5,
                override_frequency: 0.0,
                tx_power: 0,
                use_preset: true,
                tx_enabled: true,
                hop_limit: 3,
            },
            staged: None,
            events,
            fail_next: None,
        }
    }

    #[cfg(test)]
    pub fn settings(&self) -> &LoraConfig {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.node_ready
    }

    #[cfg(test)]
    /// Make the next settings or send call fail with `err`.
    pub fn fail_next(&mut self, err: RadioError) {
        self.fail_next = Some(err);
    }

    #[cfg(test)]
    /// Report a decoded text packet as if heard over the air.
    pub fn deliver(&self, packet_id: u32, text: impl Into<String>) {
        let _ = self.events.send(RadioEvent::Received {
            packet_id,
            text: text.into(),
        });
    }

    fn ensure_ready(&mut self) -> Result<(), RadioError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        if !self.is_connected() {
            return Err(RadioError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl Radio for SimRadio {
    fn device_path(&self) -> &str {
        &self.device_path
    }

    async fn lora_config(&mut self) -> Result<LoraConfig, RadioError> {
        self.ensure_ready()?;
        Ok(self.settings.clone())
    }

    async fn begin_settings_transaction(&mut self) -> Result<(), RadioError> {
        self.ensure_ready()?;
        self.staged = Some(self.settings.clone());
        Ok(())
    }

    async fn write_lora_config(&mut self, config: &LoraConfig) -> Result<(), RadioError> {
        self.ensure_ready()?;
        match self.staged.as_mut() {
            Some(staged) => {
                *staged = config.clone();
                Ok(())
            }
            None => Err(RadioError::Device(
                "settings written outside a transaction".into(),
            )),
        }
    }

    async fn commit_settings_transaction(&mut self) -> Result<(), RadioError> {
        self.ensure_ready()?;
        let staged = self
            .staged
            .take()
            .ok_or_else(|| RadioError::Device("no open settings transaction".into()))?;
        log::info!(
            "Sim node {}: committed bw={} sf={} cr={} freq={} pow={}, rebooting",
            self.device_path,
            staged.bandwidth,
            staged.spread_factor,
            staged.coding_rate,
            staged.override_frequency,
            staged.tx_power,
        );
        self.settings = staged;
        self.connected = false;
        self.node_ready = false;
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<u32, RadioError> {
        self.ensure_ready()?;

        let (id, queue_delay) = {
            let mut rng = rand::thread_rng();
            let id: u32 = rng.gen_range(1..=u32::MAX);
            let normal = Normal::new(QUEUE_DELAY_MS, QUEUE_JITTER_MS)
                .map_err(|e| RadioError::Device(e.to_string()))?;
            let delay_ms = normal.sample(&mut rng).max(0.0);
            (id, Duration::from_secs_f64(delay_ms / 1000.0))
        };
        let len = text.len();
        let airtime_ms = time_on_air_ms(&self.settings, len);
        let events = self.events.clone();

        tokio::spawn(async move {
            tokio::time::sleep(queue_delay).await;
            let _ = events.send(RadioEvent::Status(format!(
                "DEBUG | [RadioIf] Started Tx (id={:#010x} fr=0x00000000 to=0xffffffff, WantAck=0, HopLim=0 Ch=0x0 len={})",
                id, len
            )));
            tokio::time::sleep(Duration::from_millis(airtime_ms as u64)).await;
            let _ = events.send(RadioEvent::Status(format!(
                "DEBUG | [RadioIf] Packet TX: {}ms",
                airtime_ms
            )));
            let _ = events.send(RadioEvent::Status(format!(
                "DEBUG | [RadioIf] Completed sending (id={:#010x})",
                id
            )));
        });

        Ok(id)
    }

    async fn reconnect(&mut self) -> Result<(), RadioError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        log::debug!("Sim node {}: interface open", self.device_path);
        self.connected = true;
        self.node_ready = false;
        Ok(())
    }

    async fn fetch_node(&mut self) -> Result<(), RadioError> {
        if !self.connected {
            return Err(RadioError::NotConnected);
        }
        self.node_ready = true;
        Ok(())
    }
}
