/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::borrow::Cow;
use std::fmt::Display;

use smtp_proto::Response;

pub mod delivery;
pub mod lookup;
pub mod session;

/// A remote server's verdict on a transaction: the first negative reply to
/// MAIL/RCPT/DATA, or the final reply after the message data.
#[derive(Debug, PartialEq, Eq)]
pub struct HostResponse {
    pub hostname: String,
    pub response: Response<String>,
}

impl HostResponse {
    pub fn accepted(&self) -> bool {
        (200..300).contains(&self.response.code)
    }

    /// The reply as a classification/logging string: reply code, enhanced
    /// status code when present, then the message text.
    pub fn text(&self) -> String {
        response_text(&self.response)
    }
}

pub fn response_text(response: &Response<String>) -> String {
    if response.esc[0] > 0 {
        format!(
            "{} {}.{}.{} {}",
            response.code, response.esc[0], response.esc[1], response.esc[2], response.message
        )
    } else {
        format!("{} {}", response.code, response.message)
    }
}

/// A failed attempt that produced no server verdict. Always classified as
/// transient; the text fed to the classifier is the server's partial reply
/// when one exists, the OS error otherwise.
#[derive(Debug)]
pub enum Error {
    /// MX resolution failed; carries the synthetic `450` reply.
    Dns(String),
    /// All exchanges and addresses were exhausted; synthetic `450` reply.
    Unreachable(String),
    /// The recipient domain advertises a null MX.
    NullMx(String),
    Connection(ErrorDetails),
    Tls(ErrorDetails),
    Fetch(ErrorDetails),
}

#[derive(Debug)]
pub struct ErrorDetails {
    pub entity: String,
    pub details: String,
}

impl Error {
    pub fn mx_not_found(domain: &str) -> Self {
        Error::Dns(format!("450 Can't find an MX server for {domain}"))
    }

    pub fn unreachable(domain: &str) -> Self {
        Error::Unreachable(format!("450 Can't connect to any MX server for {domain}"))
    }

    pub fn null_mx(domain: &str) -> Self {
        Error::NullMx(format!("550 Domain {domain} does not accept mail (null MX)"))
    }

    /// Maps transport-level failures reported by the SMTP client. Server
    /// replies that reach this path (greeting, EHLO, AUTH) belong to session
    /// establishment and are carried as connection details.
    pub fn from_smtp_error(hostname: &str, err: mail_send::Error) -> Self {
        match err {
            mail_send::Error::UnexpectedReply(reply) => Error::Connection(ErrorDetails {
                entity: hostname.to_string(),
                details: response_text(&reply),
            }),
            mail_send::Error::AuthenticationFailed(reply) => Error::Connection(ErrorDetails {
                entity: hostname.to_string(),
                details: format!("AUTH rejected: {}", response_text(&reply)),
            }),
            mail_send::Error::Timeout => Error::Connection(ErrorDetails {
                entity: hostname.to_string(),
                details: "Connection timed out".to_string(),
            }),
            mail_send::Error::Tls(err) => Error::Tls(ErrorDetails {
                entity: hostname.to_string(),
                details: format!("Handshake failed: {err}"),
            }),
            mail_send::Error::InvalidTLSName => Error::Tls(ErrorDetails {
                entity: hostname.to_string(),
                details: "Invalid hostname".to_string(),
            }),
            mail_send::Error::Io(err) => Error::Connection(ErrorDetails {
                entity: hostname.to_string(),
                details: err.to_string(),
            }),
            err => Error::Connection(ErrorDetails {
                entity: hostname.to_string(),
                details: err.to_string(),
            }),
        }
    }

    /// The string handed to the bounce classifier and the queue authority.
    pub fn reply_text(&self) -> Cow<'_, str> {
        match self {
            Error::Dns(reply) | Error::Unreachable(reply) | Error::NullMx(reply) => {
                Cow::Borrowed(reply.as_str())
            }
            Error::Connection(details) | Error::Tls(details) | Error::Fetch(details) => {
                Cow::Borrowed(details.details.as_str())
            }
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Dns(reply) | Error::Unreachable(reply) | Error::NullMx(reply) => {
                f.write_str(reply)
            }
            Error::Connection(details) => write!(
                f,
                "Connection to '{}' failed: {}",
                details.entity, details.details
            ),
            Error::Tls(details) => write!(
                f,
                "TLS error from '{}': {}",
                details.entity, details.details
            ),
            Error::Fetch(details) => write!(
                f,
                "Failed to fetch body of '{}': {}",
                details.entity, details.details
            ),
        }
    }
}
