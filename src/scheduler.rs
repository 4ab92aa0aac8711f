use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::config::Station;
use crate::cuesheet::{Cuesheet, Scenario};
use crate::error::Result;
use crate::event;
use crate::eventlog::{unix_now, SharedEventLog};
use crate::radio::{apply_lora_config, reconnect, Radio, RadioEvent, RetryPolicy};
use crate::tracker::{TxTracker, POLL_INTERVAL};

/// Shortest pause a listening station takes inside a window.
const MIN_LISTEN: Duration = Duration::from_millis(500);

const FILLER: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// `<unix ts>,<elapsed>,<seq>|` padded with random letters to `size` bytes.
/// A header longer than `size` is sent as is.
pub fn build_payload(ts: f64, elapsed: f64, seq: u64, size: usize) -> String {
    let mut text = format!("{},{},{}|", ts, elapsed, seq);
    let mut rng = rand::thread_rng();
    while text.len() < size {
        if let Some(&c) = FILLER.choose(&mut rng) {
            text.push(c as char);
        }
    }
    text
}

/// Walks the cuesheet one scenario at a time against the experiment clock.
pub struct Scheduler<R: Radio> {
    radio: R,
    tracker: Arc<TxTracker>,
    events: SharedEventLog,
    this_station: Station,
    retry: RetryPolicy,
    start: Instant,
    num_packets: u64,
}

impl<R: Radio> Scheduler<R> {
    pub fn new(
        radio: R,
        tracker: Arc<TxTracker>,
        events: SharedEventLog,
        this_station: Station,
    ) -> Self {
        Self {
            radio,
            tracker,
            events,
            this_station,
            retry: RetryPolicy::default(),
            start: Instant::now(),
            num_packets: 0,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Transmissions attempted so far.
    pub fn num_packets(&self) -> u64 {
        self.num_packets
    }

    /// Seconds since [`run`](Self::run) was entered.
    fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Run every scenario in order. The experiment clock starts now.
    pub async fn run(&mut self, mut cuesheet: Cuesheet) -> Result<()> {
        self.start = Instant::now();
        while let Some(scenario) = cuesheet.pop_front() {
            self.run_scenario(&scenario).await?;
        }
        log::info!("Cuesheet exhausted after {} packets", self.num_packets);
        Ok(())
    }

    async fn run_scenario(&mut self, scenario: &Scenario) -> Result<()> {
        let prefix = scenario.fingerprint();
        log::info!("Scenario {} ({}): {:?}", prefix, scenario.sender, scenario);

        log::info!("Configure radio");
        self.configure(scenario).await?;

        log::info!("Waiting for start at T+{}s", scenario.start);
        let start = scenario.start as f64;
        while self.elapsed() < start {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        log::info!("Starting scenario");
        let end = scenario.end as f64;
        loop {
            let t = self.elapsed();
            if t >= end {
                break;
            }
            if scenario.sender == self.this_station {
                self.num_packets += 1;
                self.send_packet(scenario, &prefix, t).await?;
                tokio::time::sleep(Duration::from_secs(scenario.between)).await;
            } else {
                let remaining = Duration::from_secs_f64(end - t).max(MIN_LISTEN);
                tokio::time::sleep(remaining).await;
            }
        }
        log::info!("Scenario complete");
        Ok(())
    }

    /// Apply the scenario's settings, reconnecting after every failure and
    /// after every commit (the node reboots to take new LoRa settings).
    async fn configure(&mut self, scenario: &Scenario) -> Result<()> {
        let desired = scenario.lora_config();
        loop {
            match apply_lora_config(&mut self.radio, &desired).await {
                Ok(true) => {
                    reconnect(&mut self.radio, &self.retry).await?;
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(e) => {
                    log::warn!("Configuring radio failed: {}, reconnecting", e);
                    reconnect(&mut self.radio, &self.retry).await?;
                }
            }
        }
    }

    async fn send_packet(&mut self, scenario: &Scenario, prefix: &str, t: f64) -> Result<()> {
        let text = build_payload(unix_now(), t, self.num_packets, scenario.size);
        log::info!("{:.1} {} sending {}", t, scenario.sender, text);

        let packet_id = match self.radio.send_text(&text).await {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Send failed: {}, reconnecting", e);
                reconnect(&mut self.radio, &self.retry).await?;
                return Ok(());
            }
        };

        self.events
            .lock()
            .await
            .record(event! {
                "event" => "queued",
                "packet_id" => packet_id,
                "scenario" => prefix,
            })
            .await?;

        if let Some(duration_ms) = self.tracker.wait_for_tx(packet_id).await {
            self.events
                .lock()
                .await
                .record(event! {
                    "event" => "sent",
                    "packet_id" => packet_id,
                    "duration_ms" => duration_ms,
                    "text" => text,
                })
                .await?;
        }
        Ok(())
    }
}

/// Route radio output: status lines to the tracker, received packets to the
/// event log. Returns when the radio side of the channel is dropped.
pub async fn pump_radio_events(
    mut rx: UnboundedReceiver<RadioEvent>,
    tracker: Arc<TxTracker>,
    events: SharedEventLog,
) {
    while let Some(radio_event) = rx.recv().await {
        match radio_event {
            RadioEvent::Status(line) => {
                log::trace!("status: {}", line);
                tracker.on_status(&line);
            }
            RadioEvent::Received { packet_id, text } => {
                let result = events
                    .lock()
                    .await
                    .record(event! {
                        "event" => "received",
                        "packet_id" => packet_id,
                        "text" => text,
                    })
                    .await;
                if let Err(e) = result {
                    log::error!("Failed to log received packet {}: {}", packet_id, e);
                }
            }
        }
    }
}
