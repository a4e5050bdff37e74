/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// In-process queue authority speaking the line-framed JSON protocol.
/// `GET` pops from the job queue; every other command is recorded and
/// acknowledged with `{"updated": true}`.
pub struct MockQueue {
    pub addr: String,
    jobs: Arc<Mutex<VecDeque<Value>>>,
    commands: Arc<Mutex<Vec<Value>>>,
}

impl MockQueue {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let jobs = Arc::new(Mutex::new(VecDeque::new()));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let accept_jobs = jobs.clone();
        let accept_commands = commands.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let jobs = accept_jobs.clone();
                let commands = accept_commands.clone();
                tokio::spawn(async move {
                    let _ = serve_queue(stream, jobs, commands).await;
                });
            }
        });

        MockQueue {
            addr,
            jobs,
            commands,
        }
    }

    pub fn push_job(&self, delivery: Value, lock: &str) {
        self.jobs
            .lock()
            .unwrap()
            .push_back(json!({"delivery": delivery, "lock": lock}));
    }

    pub fn commands(&self) -> Vec<Value> {
        self.commands.lock().unwrap().clone()
    }

    /// Waits until at least `count` terminal commands arrived.
    pub async fn wait_for_commands(&self, count: usize) -> Vec<Value> {
        for _ in 0..500 {
            {
                let commands = self.commands.lock().unwrap();
                if commands.len() >= count {
                    return commands.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {count} queue commands, got {:?}",
            self.commands()
        );
    }
}

async fn serve_queue(
    stream: TcpStream,
    jobs: Arc<Mutex<VecDeque<Value>>>,
    commands: Arc<Mutex<Vec<Value>>>,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => return Ok(()),
        };
        let response = if request["cmd"] == "GET" {
            jobs.lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({}))
        } else {
            commands.lock().unwrap().push(request);
            json!({"updated": true})
        };
        let mut reply = response.to_string();
        reply.push('\n');
        stream.get_mut().write_all(reply.as_bytes()).await?;
    }
}

#[derive(Clone)]
pub struct SmtpBehavior {
    pub mail_reply: String,
    pub rcpt_reply: String,
    /// Final reply after the message data.
    pub data_reply: String,
    pub starttls: StartTls,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StartTls {
    /// STARTTLS is not advertised at all.
    NotAdvertised,
    /// STARTTLS is advertised and accepted, then the handshake is wrecked
    /// by writing garbage instead of a TLS record.
    Broken,
}

impl Default for SmtpBehavior {
    fn default() -> Self {
        SmtpBehavior {
            mail_reply: "250 2.1.0 sender ok".to_string(),
            rcpt_reply: "250 2.1.5 recipient ok".to_string(),
            data_reply: "250 2.0.0 OK queued".to_string(),
            starttls: StartTls::NotAdvertised,
        }
    }
}

#[derive(Default)]
pub struct SmtpState {
    pub connections: usize,
    pub transcript: Vec<String>,
    /// Raw DATA payloads, terminator excluded.
    pub messages: Vec<Vec<u8>>,
}

/// Scripted SMTP server; enough of the protocol for one delivery per
/// connection.
pub struct MockSmtp {
    pub port: u16,
    pub state: Arc<Mutex<SmtpState>>,
}

impl MockSmtp {
    pub async fn start(behavior: SmtpBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(SmtpState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.lock().unwrap().connections += 1;
                let behavior = behavior.clone();
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve_smtp(stream, behavior, state).await;
                });
            }
        });

        MockSmtp { port, state }
    }

    pub fn transcript(&self) -> Vec<String> {
        self.state.lock().unwrap().transcript.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub async fn wait_for_message(&self) -> Vec<u8> {
        for _ in 0..500 {
            {
                let state = self.state.lock().unwrap();
                if let Some(message) = state.messages.first() {
                    return message.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for a message");
    }
}

async fn serve_smtp(
    stream: TcpStream,
    behavior: SmtpBehavior,
    state: Arc<Mutex<SmtpState>>,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(b"220 mock.test ESMTP ready\r\n")
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end().to_string();
        state.lock().unwrap().transcript.push(command.clone());
        let upper = command.to_ascii_uppercase();

        if upper.starts_with("EHLO") || upper.starts_with("LHLO") {
            let mut reply = String::from("250-mock.test\r\n250-SIZE 10485760\r\n");
            if behavior.starttls == StartTls::Broken {
                reply.push_str("250-STARTTLS\r\n");
            }
            reply.push_str("250 ENHANCEDSTATUSCODES\r\n");
            stream.get_mut().write_all(reply.as_bytes()).await?;
        } else if upper.starts_with("STARTTLS") {
            stream.get_mut().write_all(b"220 2.0.0 ready\r\n").await?;
            // Not a TLS record; the client handshake collapses.
            stream.get_mut().write_all(b"!plaintext!\r\n").await?;
            return Ok(());
        } else if upper.starts_with("MAIL") {
            let reply = format!("{}\r\n", behavior.mail_reply);
            stream.get_mut().write_all(reply.as_bytes()).await?;
        } else if upper.starts_with("RCPT") {
            let reply = format!("{}\r\n", behavior.rcpt_reply);
            stream.get_mut().write_all(reply.as_bytes()).await?;
        } else if upper.starts_with("DATA") {
            stream
                .get_mut()
                .write_all(b"354 go ahead, end with <CRLF>.<CRLF>\r\n")
                .await?;
            let mut message = Vec::new();
            let mut data_line = Vec::new();
            loop {
                data_line.clear();
                if stream.read_until(b'\n', &mut data_line).await? == 0 {
                    return Ok(());
                }
                if data_line == b".\r\n" {
                    break;
                }
                message.extend_from_slice(&data_line);
            }
            state.lock().unwrap().messages.push(message);
            let reply = format!("{}\r\n", behavior.data_reply);
            stream.get_mut().write_all(reply.as_bytes()).await?;
        } else if upper.starts_with("QUIT") {
            stream.get_mut().write_all(b"221 2.0.0 bye\r\n").await?;
            return Ok(());
        } else {
            stream.get_mut().write_all(b"250 2.0.0 ok\r\n").await?;
        }
    }
}

/// Minimal body store: answers every GET with the configured body.
pub struct MockBodyStore {
    pub port: u16,
}

impl MockBodyStore {
    pub async fn start(body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let _ = serve_body(stream, body).await;
                });
            }
        });

        MockBodyStore { port }
    }
}

async fn serve_body(stream: TcpStream, body: Vec<u8>) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    read_http_headers(&mut stream).await?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.get_mut().write_all(header.as_bytes()).await?;
    stream.get_mut().write_all(&body).await?;
    stream.get_mut().shutdown().await
}

/// Records JSON bodies POSTed to the bounce webhook.
pub struct MockWebhook {
    pub url: String,
    payloads: Arc<Mutex<Vec<Value>>>,
}

impl MockWebhook {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/bounces", listener.local_addr().unwrap());
        let payloads = Arc::new(Mutex::new(Vec::new()));

        let accept_payloads = payloads.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let payloads = accept_payloads.clone();
                tokio::spawn(async move {
                    let _ = serve_webhook(stream, payloads).await;
                });
            }
        });

        MockWebhook { url, payloads }
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }

    pub async fn wait_for_payload(&self) -> Value {
        for _ in 0..500 {
            {
                let payloads = self.payloads.lock().unwrap();
                if let Some(payload) = payloads.first() {
                    return payload.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for a webhook payload");
    }
}

async fn serve_webhook(stream: TcpStream, payloads: Arc<Mutex<Vec<Value>>>) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    let content_length = read_http_headers(&mut stream).await?;
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).await?;
    if let Ok(payload) = serde_json::from_slice(&body) {
        payloads.lock().unwrap().push(payload);
    }
    stream
        .get_mut()
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    stream.get_mut().shutdown().await
}

async fn read_http_headers(stream: &mut BufReader<TcpStream>) -> std::io::Result<usize> {
    let mut content_length = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 || line == "\r\n" {
            return Ok(content_length);
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
}
