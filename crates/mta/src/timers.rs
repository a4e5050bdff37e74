/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;

/// Named latency counters. Counters accumulate forever in `total_*` while the
/// `window_*` pair is rotated into `prev_*` on every flush, so flush output
/// reports rates over the window since the previous flush only.
#[derive(Default)]
pub struct TimerRegistry {
    timers: Mutex<AHashMap<String, Timer>>,
}

#[derive(Debug)]
pub struct Timer {
    pub total_sum: u64,
    pub total_count: u64,
    pub window_sum: u64,
    pub window_count: u64,
    pub prev_sum: u64,
    pub prev_count: u64,
    pub epoch: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Timer {
            total_sum: 0,
            total_count: 0,
            window_sum: 0,
            window_count: 0,
            prev_sum: 0,
            prev_count: 0,
            epoch: Instant::now(),
        }
    }
}

impl TimerRegistry {
    pub fn record(&self, name: &str, elapsed: Duration) {
        let elapsed = elapsed.as_micros() as u64;
        let mut timers = self.timers.lock();
        let timer = timers.entry(name.to_string()).or_default();
        timer.total_sum += elapsed;
        timer.total_count += 1;
        timer.window_sum += elapsed;
        timer.window_count += 1;
    }

    /// Logs per-second rates for the window since the last flush and rotates
    /// the window counters, preserving totals.
    pub fn flush(&self) {
        let now = Instant::now();
        for (name, timer) in self.timers.lock().iter_mut() {
            let window = now.duration_since(timer.epoch).as_secs_f64();
            if timer.window_count > 0 && window > 0.0 {
                tracing::info!(
                    context = "timers",
                    event = "flush",
                    name = name.as_str(),
                    rate_per_s = timer.window_count as f64 / window,
                    avg_ms = timer.window_sum as f64 / timer.window_count as f64 / 1000.0,
                    total = timer.total_count,
                );
            }
            timer.prev_sum = timer.window_sum;
            timer.prev_count = timer.window_count;
            timer.window_sum = 0;
            timer.window_count = 0;
            timer.epoch = now;
        }
    }

    /// Total (sum_micros, count) pair recorded under a name so far.
    pub fn totals(&self, name: &str) -> Option<(u64, u64)> {
        self.timers
            .lock()
            .get(name)
            .map(|t| (t.total_sum, t.total_count))
    }
}

pub fn spawn_flush(timers: Arc<TimerRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            timers.flush();
        }
    })
}
