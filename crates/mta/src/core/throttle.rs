/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// The zone speedometer: a token window shared by every worker of a zone.
/// Callers are delayed, not refused, so the zone's aggregate delivery rate
/// never exceeds `max_messages` per `interval`.
pub struct Speedometer {
    max_messages: u64,
    interval: Duration,
    window: Mutex<Window>,
}

struct Window {
    epoch: Instant,
    sent: u64,
}

impl Speedometer {
    pub fn new(max_messages: u64, interval: Duration) -> Self {
        Speedometer {
            max_messages: max_messages.max(1),
            interval,
            window: Mutex::new(Window {
                epoch: Instant::now(),
                sent: 0,
            }),
        }
    }

    /// Consumes one send slot, or reports how long to wait for the window to
    /// roll over.
    pub fn try_acquire(&self) -> Option<Duration> {
        let mut window = self.window.lock();
        if window.epoch.elapsed() >= self.interval {
            window.epoch = Instant::now();
            window.sent = 0;
        }
        if window.sent < self.max_messages {
            window.sent += 1;
            None
        } else {
            Some(self.interval.saturating_sub(window.epoch.elapsed()))
        }
    }

    /// Delays the caller until a send slot is free.
    pub async fn acquire(&self) {
        while let Some(wait) = self.try_acquire() {
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}
