/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{AckResponse, Command, GetResponse, Job};
use crate::timers::TimerRegistry;

/// The request/response channel to the queue authority: one JSON object per
/// LF-terminated line, strictly one command in flight. Any transport or
/// protocol error here is fatal to the owning worker; the supervisor
/// reconnects with a fresh client.
pub struct QueueClient {
    stream: BufReader<TcpStream>,
    zone: String,
    timeout: Duration,
    timers: Arc<TimerRegistry>,
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Proto(String),
    Closed,
    Timeout,
}

impl QueueClient {
    pub async fn connect(
        addr: &str,
        zone: impl Into<String>,
        timeout: Duration,
        timers: Arc<TimerRegistry>,
    ) -> Result<Self, Error> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::Io)?;
        Ok(QueueClient {
            stream: BufReader::new(stream),
            zone: zone.into(),
            timeout,
            timers,
        })
    }

    /// Asks for the next locked delivery; `None` means the queue is empty.
    pub async fn get(&mut self) -> Result<Option<Job>, Error> {
        let response: GetResponse = self
            .send_command(&Command::Get {
                zone: self.zone.clone(),
            })
            .await?;
        match (response.delivery, response.lock) {
            (Some(delivery), Some(lock)) => Ok(Some(Job { delivery, lock })),
            (None, _) => Ok(None),
            (Some(delivery), None) => Err(Error::Proto(format!(
                "GET returned delivery {}.{} without a lock",
                delivery.id, delivery.seq
            ))),
        }
    }

    pub async fn release(&mut self, id: &str, seq: u32, lock: &str) -> Result<bool, Error> {
        let response: AckResponse = self
            .send_command(&Command::Release {
                id: id.to_string(),
                seq,
                lock: lock.to_string(),
            })
            .await?;
        self.check_updated("RELEASE", id, seq, response.updated);
        Ok(response.updated)
    }

    pub async fn defer(&mut self, id: &str, seq: u32, lock: &str, ttl: u64) -> Result<bool, Error> {
        let response: AckResponse = self
            .send_command(&Command::Defer {
                id: id.to_string(),
                seq,
                lock: lock.to_string(),
                ttl,
            })
            .await?;
        self.check_updated("DEFER", id, seq, response.updated);
        Ok(response.updated)
    }

    pub async fn bounce(&mut self, command: Command) -> Result<bool, Error> {
        debug_assert!(matches!(command, Command::Bounce { .. }));
        let response: AckResponse = self.send_command(&command).await?;
        Ok(response.updated)
    }

    fn check_updated(&self, command: &str, id: &str, seq: u32, updated: bool) {
        if !updated {
            // The authority refused the lock; another worker may have taken
            // over after a lock expiry.
            tracing::warn!(
                context = "queue",
                event = "not-updated",
                command = command,
                id = id,
                seq = seq,
            );
        }
    }

    async fn send_command<R: DeserializeOwned>(&mut self, command: &Command) -> Result<R, Error> {
        let started = Instant::now();
        let mut line = serde_json::to_string(command)
            .map_err(|err| Error::Proto(format!("Failed to encode command: {err}")))?;
        line.push('\n');

        tokio::time::timeout(self.timeout, async {
            self.stream.get_mut().write_all(line.as_bytes()).await?;
            self.stream.get_mut().flush().await
        })
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::Io)?;

        let mut reply = String::new();
        let read = tokio::time::timeout(self.timeout, self.stream.read_line(&mut reply))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(Error::Io)?;
        if read == 0 {
            return Err(Error::Closed);
        }

        let response = serde_json::from_str(&reply)
            .map_err(|err| Error::Proto(format!("Invalid response to {}: {err}", command.name())))?;
        self.timers
            .record(&format!("Command:{}", command.name()), started.elapsed());
        Ok(response)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "Queue channel I/O error: {err}"),
            Error::Proto(err) => write!(f, "Queue protocol error: {err}"),
            Error::Closed => f.write_str("Queue channel closed by the authority"),
            Error::Timeout => f.write_str("Queue command timed out"),
        }
    }
}

impl std::error::Error for Error {}
