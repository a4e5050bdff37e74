/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use mail_send::{smtp::AssertReply, Credentials, SmtpClient};
use rustls::ServerName;
use smtp_proto::{EhloResponse, Response, Severity, EXT_SIZE, EXT_START_TLS};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::{client::TlsStream, TlsConnector};

use super::{response_text, Error, ErrorDetails, HostResponse};
use crate::fetch::BodyStream;

const TIMEOUT_CONNECT: Duration = Duration::from_secs(60);
const TIMEOUT_GREETING: Duration = Duration::from_secs(120);
const TIMEOUT_EHLO: Duration = Duration::from_secs(60);
const TIMEOUT_AUTH: Duration = Duration::from_secs(60);
const TIMEOUT_TLS: Duration = Duration::from_secs(60);
const TIMEOUT_MAIL: Duration = Duration::from_secs(300);
const TIMEOUT_RCPT: Duration = Duration::from_secs(300);
const TIMEOUT_DATA_INIT: Duration = Duration::from_secs(120);
const TIMEOUT_DATA_BLOCK: Duration = Duration::from_secs(180);
const TIMEOUT_DATA_FINAL: Duration = Duration::from_secs(600);

pub struct DialParams<'x> {
    pub hostname: &'x str,
    pub ip: IpAddr,
    pub port: u16,
    pub source_ip: Option<IpAddr>,
    pub local_name: &'x str,
    pub secure: bool,
    pub allow_starttls: bool,
    pub require_tls: bool,
    pub credentials: Option<&'x Credentials<String>>,
    pub connector: &'x TlsConnector,
    pub log_transcript: bool,
}

/// Dial failures split into the TLS-upgrade kind, which the caller answers
/// with a plaintext retry on the same address, and everything else.
#[derive(Debug)]
pub enum DialError {
    StartTls(Error),
    Other(Error),
}

pub struct Envelope<'x> {
    pub from: &'x str,
    pub to: &'x [String],
    pub size: usize,
}

pub enum Session {
    Plain(Established<TcpStream>),
    Tls(Established<TlsStream<TcpStream>>),
}

pub struct Established<T: AsyncRead + AsyncWrite + Unpin> {
    client: SmtpClient<T>,
    hostname: String,
    local_name: String,
    credentials: Option<Credentials<String>>,
    log_transcript: bool,
}

/// Establishes an SMTP session on one (exchange, address) pair: connect,
/// greeting, EHLO, then implicit TLS or opportunistic STARTTLS, per the
/// zone policy. AUTH happens later, inside `send`, after the post-upgrade
/// EHLO. No certificate is ever validated here; opportunistic TLS encrypts
/// but does not authenticate.
pub async fn dial(params: DialParams<'_>) -> Result<Session, DialError> {
    let mut client = connect(&params).await.map_err(DialError::Other)?;

    if params.secure {
        // Implicit TLS: the handshake precedes the greeting.
        client.timeout = TIMEOUT_TLS;
        let mut client = into_tls(client, params.connector, params.hostname)
            .await
            .map_err(DialError::Other)?;
        client.timeout = TIMEOUT_GREETING;
        read_greeting(&mut client, params.hostname)
            .await
            .map_err(DialError::Other)?;
        return Ok(Session::Tls(Established::new(client, &params)));
    }

    client.timeout = TIMEOUT_GREETING;
    read_greeting(&mut client, params.hostname)
        .await
        .map_err(DialError::Other)?;

    if params.allow_starttls {
        client.timeout = TIMEOUT_EHLO;
        let capabilities = say_helo(&mut client, params.local_name, params.hostname)
            .await
            .map_err(DialError::Other)?;
        if capabilities.has_capability(EXT_START_TLS) {
            client.timeout = TIMEOUT_TLS;
            match client.cmd(b"STARTTLS\r\n").await {
                Ok(response) if response.code == 220 => {
                    return match into_tls(client, params.connector, params.hostname).await {
                        Ok(client) => Ok(Session::Tls(Established::new(client, &params))),
                        Err(err) => Err(DialError::StartTls(err)),
                    };
                }
                Ok(response) => {
                    // Refused in-band; carry on in plaintext.
                    tracing::debug!(
                        context = "tls",
                        event = "starttls-refused",
                        mx = params.hostname,
                        reply = %response_text(&response),
                    );
                }
                Err(err) => {
                    return Err(DialError::Other(Error::from_smtp_error(
                        params.hostname,
                        err,
                    )))
                }
            }
        }
    }

    if params.require_tls {
        return Err(DialError::Other(Error::Tls(ErrorDetails {
            entity: params.hostname.to_string(),
            details: "TLS is required for this zone but was not available".to_string(),
        })));
    }

    Ok(Session::Plain(Established::new(client, &params)))
}

/// TCP connect, bound to the zone's pool address when one was selected.
async fn connect(params: &DialParams<'_>) -> Result<SmtpClient<TcpStream>, Error> {
    let remote_addr = SocketAddr::new(params.ip, params.port);
    tokio::time::timeout(TIMEOUT_CONNECT, async {
        let stream = match params.source_ip {
            Some(source_ip) => {
                let socket = if remote_addr.is_ipv6() {
                    TcpSocket::new_v6()?
                } else {
                    TcpSocket::new_v4()?
                };
                socket.bind(SocketAddr::new(source_ip, 0))?;
                socket.connect(remote_addr).await?
            }
            None => TcpStream::connect(remote_addr).await?,
        };
        Ok(SmtpClient {
            stream,
            timeout: TIMEOUT_CONNECT,
        })
    })
    .await
    .map_err(|_| {
        Error::Connection(ErrorDetails {
            entity: params.hostname.to_string(),
            details: "Connection timed out".to_string(),
        })
    })?
    .map_err(|err: std::io::Error| {
        Error::Connection(ErrorDetails {
            entity: params.hostname.to_string(),
            details: err.to_string(),
        })
    })
}

/// Wraps the plaintext stream into TLS. Used both for implicit-TLS zones and
/// for the STARTTLS upgrade; any failure in here counts as the TLS error
/// kind that triggers the caller's plaintext downgrade.
async fn into_tls(
    client: SmtpClient<TcpStream>,
    tls_connector: &TlsConnector,
    tls_hostname: &str,
) -> Result<SmtpClient<TlsStream<TcpStream>>, Error> {
    let timeout = client.timeout;
    tokio::time::timeout(timeout, async {
        let stream = tls_connector
            .connect(
                ServerName::try_from(tls_hostname).map_err(|_| {
                    Error::Tls(ErrorDetails {
                        entity: tls_hostname.to_string(),
                        details: "Invalid hostname".to_string(),
                    })
                })?,
                client.stream,
            )
            .await
            .map_err(|err| {
                Error::Tls(ErrorDetails {
                    entity: tls_hostname.to_string(),
                    details: format!("Handshake failed: {err}"),
                })
            })?;
        Ok(SmtpClient { stream, timeout })
    })
    .await
    .map_err(|_| {
        Error::Tls(ErrorDetails {
            entity: tls_hostname.to_string(),
            details: "TLS handshake timed out".to_string(),
        })
    })?
}

pub async fn read_greeting<T: AsyncRead + AsyncWrite + Unpin>(
    client: &mut SmtpClient<T>,
    hostname: &str,
) -> Result<(), Error> {
    client
        .read()
        .await
        .and_then(|reply| reply.assert_positive_completion())
        .map_err(|err| Error::from_smtp_error(hostname, err))
}

pub async fn say_helo<T: AsyncRead + AsyncWrite + Unpin>(
    client: &mut SmtpClient<T>,
    local_name: &str,
    hostname: &str,
) -> Result<EhloResponse<String>, Error> {
    client
        .capabilities(local_name, false)
        .await
        .map_err(|err| Error::from_smtp_error(hostname, err))
}

impl Session {
    pub async fn send(
        &mut self,
        envelope: &Envelope<'_>,
        headers: &[u8],
        body: &mut dyn BodyStream,
    ) -> Result<HostResponse, Error> {
        match self {
            Session::Plain(session) => session.send(envelope, headers, body).await,
            Session::Tls(session) => session.send(envelope, headers, body).await,
        }
    }

    /// Best-effort QUIT; the socket closes on every path regardless.
    pub async fn close(self) {
        match self {
            Session::Plain(mut session) => {
                let _ = session.client.stream.write_all(b"QUIT\r\n").await;
                let _ = session.client.stream.shutdown().await;
            }
            Session::Tls(mut session) => {
                let _ = session.client.stream.write_all(b"QUIT\r\n").await;
                let _ = session.client.stream.shutdown().await;
            }
        }
    }

    pub fn local_name(&self) -> &str {
        match self {
            Session::Plain(session) => &session.local_name,
            Session::Tls(session) => &session.local_name,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Session::Tls(_))
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Established<T> {
    fn new(client: SmtpClient<T>, params: &DialParams<'_>) -> Self {
        Established {
            client,
            hostname: params.hostname.to_string(),
            local_name: params.local_name.to_string(),
            credentials: params.credentials.cloned(),
            log_transcript: params.log_transcript,
        }
    }

    async fn send(
        &mut self,
        envelope: &Envelope<'_>,
        headers: &[u8],
        body: &mut dyn BodyStream,
    ) -> Result<HostResponse, Error> {
        // Fresh EHLO: mandatory after a TLS upgrade, harmless otherwise.
        self.client.timeout = TIMEOUT_EHLO;
        let capabilities = say_helo(&mut self.client, &self.local_name, &self.hostname).await?;

        if let Some(credentials) = self.credentials.clone() {
            self.client.timeout = TIMEOUT_AUTH;
            if let Err(err) = self.client.authenticate(&credentials, &capabilities).await {
                return Err(Error::from_smtp_error(&self.hostname, err));
            }
        }

        self.client.timeout = TIMEOUT_MAIL;
        let cmd = build_mail_from(envelope, &capabilities);
        let reply = self.cmd(&cmd).await?;
        if reply.severity() != Severity::PositiveCompletion {
            return Ok(self.verdict(reply));
        }

        self.client.timeout = TIMEOUT_RCPT;
        for rcpt in envelope.to {
            let cmd = format!("RCPT TO:<{rcpt}>\r\n");
            let reply = self.cmd(&cmd).await?;
            if reply.severity() != Severity::PositiveCompletion {
                return Ok(self.verdict(reply));
            }
        }

        self.client.timeout = TIMEOUT_DATA_INIT;
        let reply = self.cmd("DATA\r\n").await?;
        if reply.code != 354 {
            return Ok(self.verdict(reply));
        }

        self.write_data(headers, body).await?;

        self.client.timeout = TIMEOUT_DATA_FINAL;
        let reply = self
            .client
            .read()
            .await
            .map_err(|err| Error::from_smtp_error(&self.hostname, err))?;
        if self.log_transcript {
            tracing::debug!(
                context = "smtp",
                event = "reply",
                mx = self.hostname.as_str(),
                reply = %response_text(&reply),
            );
        }
        Ok(self.verdict(reply))
    }

    async fn cmd(&mut self, cmd: &str) -> Result<Response<String>, Error> {
        if self.log_transcript {
            tracing::debug!(
                context = "smtp",
                event = "command",
                mx = self.hostname.as_str(),
                command = cmd.trim_end(),
            );
        }
        let reply = self
            .client
            .cmd(cmd.as_bytes())
            .await
            .map_err(|err| Error::from_smtp_error(&self.hostname, err))?;
        if self.log_transcript {
            tracing::debug!(
                context = "smtp",
                event = "reply",
                mx = self.hostname.as_str(),
                reply = %response_text(&reply),
            );
        }
        Ok(reply)
    }

    /// Streams the header block and the remote body with dot-stuffing. One
    /// chunk is pulled per socket write, so back-pressure from the SMTP
    /// socket propagates into the HTTP stream without buffering the message.
    async fn write_data(&mut self, headers: &[u8], body: &mut dyn BodyStream) -> Result<(), Error> {
        self.write_chunk(headers).await?;

        let mut at_line_start = true;
        let mut last = [b'\r', b'\n'];
        let mut buf = Vec::new();
        while let Some(chunk) = body.next_chunk().await.map_err(|err| {
            Error::Fetch(ErrorDetails {
                entity: self.hostname.clone(),
                details: err.to_string(),
            })
        })? {
            escape_dots(&chunk, &mut at_line_start, &mut last, &mut buf);
            self.write_chunk(&buf).await?;
        }

        if last == [b'\r', b'\n'] {
            self.write_chunk(b".\r\n").await?;
        } else {
            self.write_chunk(b"\r\n.\r\n").await?;
        }
        self.client
            .stream
            .flush()
            .await
            .map_err(|err| self.io_error(err))?;
        Ok(())
    }

    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match tokio::time::timeout(TIMEOUT_DATA_BLOCK, self.client.stream.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.io_error(err)),
            Err(_) => Err(Error::Connection(ErrorDetails {
                entity: self.hostname.clone(),
                details: "Timeout while sending message data".to_string(),
            })),
        }
    }

    fn io_error(&self, err: std::io::Error) -> Error {
        Error::Connection(ErrorDetails {
            entity: self.hostname.clone(),
            details: err.to_string(),
        })
    }

    fn verdict(&self, response: Response<String>) -> HostResponse {
        HostResponse {
            hostname: self.hostname.clone(),
            response,
        }
    }
}

// Doubles leading dots per RFC 5321 and tracks line/tail state across chunk
// boundaries. `last` keeps the final two raw bytes so the caller knows
// whether the body already ended with CRLF before the terminator.
fn escape_dots(chunk: &[u8], at_line_start: &mut bool, last: &mut [u8; 2], buf: &mut Vec<u8>) {
    buf.clear();
    buf.reserve(chunk.len() + 16);
    for &byte in chunk {
        if *at_line_start && byte == b'.' {
            buf.push(b'.');
        }
        buf.push(byte);
        *at_line_start = byte == b'\n';
        *last = [last[1], byte];
    }
}

fn build_mail_from(envelope: &Envelope<'_>, capabilities: &EhloResponse<String>) -> String {
    let mut mail_from = String::with_capacity(envelope.from.len() + 30);
    let _ = write!(mail_from, "MAIL FROM:<{}>", envelope.from);
    if capabilities.has_capability(EXT_SIZE) {
        let _ = write!(mail_from, " SIZE={}", envelope.size);
    }
    mail_from.push_str("\r\n");
    mail_from
}
