use std::time::Duration;

use async_trait::async_trait;

use crate::config::Bandwidth;
use crate::error::RadioError;

// ---------------------------------------------------------------------------
// LoRa settings
// ---------------------------------------------------------------------------

/// The node's LoRa settings block. The scheduler only ever tunes the first
/// five fields; the rest are pinned for the experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfig {
    /// Bandwidth code in kHz (62 means 62.5 kHz).
    pub bandwidth: u32,
    pub spread_factor: u8,
    pub coding_rate: u8,
    /// MHz.
    pub override_frequency: f64,
    /// dBm.
    pub tx_power: i32,
    pub use_preset: bool,
    pub tx_enabled: bool,
    pub hop_limit: u32,
}

impl LoraConfig {
    pub fn for_experiment(bw: Bandwidth, sf: u8, cr: u8, freq: f64, pow: i32) -> Self {
        Self {
            bandwidth: bw.code(),
            spread_factor: sf,
            coding_rate: cr,
            override_frequency: freq,
            tx_power: pow,
            use_preset: false,
            tx_enabled: true,
            hop_limit: 0,
        }
    }

    /// Names of the fields whose values differ from `other`.
    pub fn changed_fields(&self, other: &LoraConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.use_preset != other.use_preset {
            changed.push("use_preset");
        }
        if self.bandwidth != other.bandwidth {
            changed.push("bandwidth");
        }
        if self.spread_factor != other.spread_factor {
            changed.push("spread_factor");
        }
        if self.coding_rate != other.coding_rate {
            changed.push("coding_rate");
        }
        if self.override_frequency != other.override_frequency {
            changed.push("override_frequency");
        }
        if self.tx_power != other.tx_power {
            changed.push("tx_power");
        }
        if self.tx_enabled != other.tx_enabled {
            changed.push("tx_enabled");
        }
        if self.hop_limit != other.hop_limit {
            changed.push("hop_limit");
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Radio interface
// ---------------------------------------------------------------------------

/// Asynchronous output of a node, delivered on the backend's own task.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Free-text firmware log line.
    Status(String),
    /// Decoded text packet heard from another station.
    Received { packet_id: u32, text: String },
}

#[async_trait]
pub trait Radio: Send {
    fn device_path(&self) -> &str;

    /// Last known LoRa settings of the node.
    async fn lora_config(&mut self) -> Result<LoraConfig, RadioError>;

    async fn begin_settings_transaction(&mut self) -> Result<(), RadioError>;

    async fn write_lora_config(&mut self, config: &LoraConfig) -> Result<(), RadioError>;

    async fn commit_settings_transaction(&mut self) -> Result<(), RadioError>;

    /// Queue a text packet; returns the packet id assigned by the node.
    async fn send_text(&mut self, text: &str) -> Result<u32, RadioError>;

    /// Re-open the low-level interface on `device_path`.
    async fn reconnect(&mut self) -> Result<(), RadioError>;

    /// Obtain the logical node handle on an open interface.
    async fn fetch_node(&mut self) -> Result<(), RadioError>;
}

/// Bring the node's settings in line with `desired`. Returns `false` without
/// touching the device when nothing differs; otherwise writes the complete
/// settings block in one transaction and returns `true`.
pub async fn apply_lora_config<R: Radio + ?Sized>(
    radio: &mut R,
    desired: &LoraConfig,
) -> Result<bool, RadioError> {
    let current = radio.lora_config().await?;
    let changed = desired.changed_fields(&current);
    if changed.is_empty() {
        log::debug!("LoRa settings already current");
        return Ok(false);
    }

    log::info!("LoRa settings changed: {}", changed.join(", "));
    radio.begin_settings_transaction().await?;
    radio.write_lora_config(desired).await?;
    radio.commit_settings_transaction().await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Pause after every raw reconnect attempt.
    pub attempt_delay: Duration,
    /// Extra pause once the node handle is obtained, before it is used.
    pub settle_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_delay: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

/// Re-establish the interface and node handle, retrying on a fixed cadence.
/// With the default policy this only returns once the node is back.
pub async fn reconnect<R: Radio + ?Sized>(
    radio: &mut R,
    policy: &RetryPolicy,
) -> Result<(), RadioError> {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let opened = match radio.reconnect().await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Reconnect to {} failed: {}", radio.device_path(), e);
                false
            }
        };
        tokio::time::sleep(policy.attempt_delay).await;

        if opened {
            match radio.fetch_node().await {
                Ok(()) => {
                    tokio::time::sleep(policy.settle_delay).await;
                    log::info!(
                        "Reconnected to {} after {} attempt(s)",
                        radio.device_path(),
                        attempts
                    );
                    return Ok(());
                }
                Err(e) => log::warn!("Node on {} not ready: {}", radio.device_path(), e),
            }
        }

        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return Err(RadioError::ReconnectExhausted { attempts });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::VecDeque;

    use tokio::time::Instant;

    /// Scripted in-memory node recording every call it receives.
    #[derive(Default)]
    pub(crate) struct FakeRadio {
        pub device: Option<LoraConfig>,
        pub calls: Vec<&'static str>,
        pub reconnect_results: VecDeque<Result<(), RadioError>>,
        pub fetch_results: VecDeque<Result<(), RadioError>>,
        pub fail_writes: u32,
        pub sends: Vec<(Instant, String)>,
        pub next_id: u32,
    }

    impl FakeRadio {
        pub fn with_device(config: LoraConfig) -> Self {
            Self {
                device: Some(config),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        fn device_path(&self) -> &str {
            "/dev/fake"
        }

        async fn lora_config(&mut self) -> Result<LoraConfig, RadioError> {
            self.calls.push("lora_config");
            self.device.clone().ok_or(RadioError::NotConnected)
        }

        async fn begin_settings_transaction(&mut self) -> Result<(), RadioError> {
            self.calls.push("begin");
            Ok(())
        }

        async fn write_lora_config(&mut self, config: &LoraConfig) -> Result<(), RadioError> {
            self.calls.push("write");
            if self.fail_writes > 0 {
                self.fail_writes -= 1;
                return Err(RadioError::Device("write rejected".into()));
            }
            self.device = Some(config.clone());
            Ok(())
        }

        async fn commit_settings_transaction(&mut self) -> Result<(), RadioError> {
            self.calls.push("commit");
            Ok(())
        }

        async fn send_text(&mut self, text: &str) -> Result<u32, RadioError> {
            self.calls.push("send");
            self.next_id += 1;
            self.sends.push((Instant::now(), text.to_string()));
            Ok(self.next_id)
        }

        async fn reconnect(&mut self) -> Result<(), RadioError> {
            self.calls.push("reconnect");
            self.reconnect_results.pop_front().unwrap_or(Ok(()))
        }

        async fn fetch_node(&mut self) -> Result<(), RadioError> {
            self.calls.push("fetch_node");
            self.fetch_results.pop_front().unwrap_or(Ok(()))
        }
    }

    fn desired() -> LoraConfig {
        LoraConfig::for_experiment(Bandwidth::Khz125, 7, 5, 915.1, 22)
    }

    #[tokio::test]
    async fn identical_settings_skip_the_transaction() {
        let mut radio = FakeRadio::with_device(desired());
        let changed = apply_lora_config(&mut radio, &desired()).await.unwrap();

        assert!(!changed);
        assert_eq!(radio.calls, vec!["lora_config"]);
    }

    #[tokio::test]
    async fn one_changed_field_writes_the_whole_block() {
        let mut current = desired();
        current.spread_factor = 12;
        let mut radio = FakeRadio::with_device(current);

        let changed = apply_lora_config(&mut radio, &desired()).await.unwrap();

        assert!(changed);
        assert_eq!(radio.calls, vec!["lora_config", "begin", "write", "commit"]);
        assert_eq!(radio.device, Some(desired()));
    }

    #[tokio::test]
    async fn apply_errors_propagate() {
        let mut radio = FakeRadio::default();
        let err = apply_lora_config(&mut radio, &desired()).await.unwrap_err();
        assert!(matches!(err, RadioError::NotConnected));

        let mut current = desired();
        current.tx_power = 10;
        let mut radio = FakeRadio::with_device(current.clone());
        radio.fail_writes = 1;
        let err = apply_lora_config(&mut radio, &desired()).await.unwrap_err();
        assert!(matches!(err, RadioError::Device(_)));
        assert_eq!(radio.device, Some(current));
        assert!(!radio.calls.contains(&"commit"));
    }

    #[test]
    fn changed_fields_names_each_difference() {
        let mut other = desired();
        other.override_frequency = 868.0;
        other.tx_enabled = false;
        assert_eq!(
            desired().changed_fields(&other),
            vec!["override_frequency", "tx_enabled"]
        );
        assert!(desired().changed_fields(&desired()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_until_the_node_answers() {
        let mut radio = FakeRadio::default();
        radio.reconnect_results = VecDeque::from(vec![
            Err(RadioError::Device("busy".into())),
            Err(RadioError::Device("busy".into())),
            Ok(()),
        ]);
        let started = Instant::now();

        reconnect(&mut radio, &RetryPolicy::default()).await.unwrap();

        assert_eq!(
            radio.calls,
            vec!["reconnect", "reconnect", "reconnect", "fetch_node"]
        );
        // three attempt delays plus the settle delay
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_retries_when_the_node_handle_fails() {
        let mut radio = FakeRadio::default();
        radio.fetch_results = VecDeque::from(vec![Err(RadioError::NotConnected)]);

        reconnect(&mut radio, &RetryPolicy::default()).await.unwrap();

        assert_eq!(
            radio.calls,
            vec!["reconnect", "fetch_node", "reconnect", "fetch_node"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_policy_gives_up() {
        let mut radio = FakeRadio::default();
        radio.reconnect_results = (0..10)
            .map(|_| Err(RadioError::Device("gone".into())))
            .collect();
        let policy = RetryPolicy {
            max_attempts: Some(4),
            ..RetryPolicy::default()
        };

        let err = reconnect(&mut radio, &policy).await.unwrap_err();

        assert!(matches!(err, RadioError::ReconnectExhausted { attempts: 4 }));
        assert_eq!(radio.calls.len(), 4);
    }
}
