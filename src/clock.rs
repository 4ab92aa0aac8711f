use std::time::Duration;

use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};

use crate::tracker::POLL_INTERVAL;

/// Next minute boundary that is a multiple of `start_at` minutes past the
/// hour, strictly after the current minute.
pub fn next_start_boundary(now: NaiveDateTime, start_at: u32) -> NaiveDateTime {
    let minute = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let step = start_at.max(1);
    let offset = step - now.minute() % step;
    minute + ChronoDuration::minutes(offset as i64)
}

/// Block until the shared start boundary so every station starts its
/// experiment clock at the same wall-clock instant.
pub async fn sleep_until_start(start_at: u32) {
    let start = next_start_boundary(Local::now().naive_local(), start_at);
    let remaining = (start - Local::now().naive_local())
        .to_std()
        .unwrap_or(Duration::ZERO);
    log::info!("Sleeping {:?} until {}", remaining, start);

    while Local::now().naive_local() < start {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    log::info!("Starting");
}
