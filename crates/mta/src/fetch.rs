/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;

use async_trait::async_trait;

/// A pull-based byte stream feeding the SMTP DATA phase. One chunk is
/// requested per socket write so the HTTP response is never buffered whole.
#[async_trait]
pub trait BodyStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error>;
}

#[derive(Debug)]
pub enum Error {
    Http(String),
    Status(u16),
    Read(String),
}

/// Fetches raw message bodies from the body store:
/// `GET http://<api.hostname>:<api.port>/fetch/<id>?body=yes`.
#[derive(Clone)]
pub struct BodyFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl BodyFetcher {
    pub fn new(http: reqwest::Client, hostname: &str, port: u16) -> Self {
        BodyFetcher {
            http,
            base_url: format!("http://{hostname}:{port}"),
        }
    }

    pub async fn fetch(&self, id: &str) -> Result<FetchedBody, Error> {
        let response = self
            .http
            .get(format!("{}/fetch/{}?body=yes", self.base_url, id))
            .send()
            .await
            .map_err(|err| Error::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Status(response.status().as_u16()));
        }
        Ok(FetchedBody { response })
    }
}

pub struct FetchedBody {
    response: reqwest::Response,
}

#[async_trait]
impl BodyStream for FetchedBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|err| Error::Read(err.to_string()))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Http(err) => write!(f, "Body fetch failed: {err}"),
            Error::Status(status) => write!(f, "Body store returned status {status}"),
            Error::Read(err) => write!(f, "Body stream failed: {err}"),
        }
    }
}
