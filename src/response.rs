use std::io::Read;
use std::path::Path;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use flate2::read::{GzDecoder, ZlibDecoder};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::Error;

pub(crate) const DEFAULT_DECODE_ERROR_MESSAGE: &str = "response body is not valid json";

/// Write granularity of [`HttpResponseStream::write_to`].
pub const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

const MAX_GUNZIP_BYTES: usize = 256 * 1024 * 1024;

enum Inflate {
    Corrupt(std::io::Error),
    Overflow,
}

/// Reads `decoder` to its end, refusing more than `limit` output bytes.
fn inflate(decoder: impl Read, limit: usize) -> Result<Bytes, Inflate> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut inflated = Vec::new();
    decoder
        .take(cap)
        .read_to_end(&mut inflated)
        .map_err(Inflate::Corrupt)?;
    if inflated.len() > limit {
        return Err(Inflate::Overflow);
    }
    Ok(Bytes::from(inflated))
}

/// Status, headers and final URL of a response, shared by buffered and
/// streaming responses.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    url: String,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: HeaderMap, url: impl Into<String>) -> Self {
        Self {
            status,
            headers,
            url: url.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL actually requested, after any rewrite rule applied.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    head: ResponseHead,
    body: Bytes,
    error_context: Option<String>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, url: impl Into<String>, body: Bytes) -> Self {
        Self {
            head: ResponseHead::new(status, headers, url),
            body,
            error_context: None,
        }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn url(&self) -> &str {
        &self.head.url
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Message carried by [`Error::Decode`] when [`HttpResponse::json`] fails.
    pub fn with_error_context(mut self, message: impl Into<String>) -> Self {
        self.error_context = Some(message.into());
        self
    }

    pub(crate) fn set_error_context(&mut self, message: Option<&str>) {
        if let Some(message) = message {
            self.error_context = Some(message.to_owned());
        }
    }

    /// Undoes the `Content-Encoding` of a received body, last listed coding
    /// first, and drops the headers that described the encoded form.
    pub(crate) fn strip_content_encoding(&mut self, host: &str, limit: usize) -> Result<(), Error> {
        let Some(header) = self.head.headers.get(CONTENT_ENCODING) else {
            return Ok(());
        };
        if self.body.is_empty() {
            return Ok(());
        }
        let unreadable = |encoding: &str, message: String| Error::DecodeContentEncoding {
            encoding: encoding.to_owned(),
            host: host.to_owned(),
            message,
        };
        let codings = header
            .to_str()
            .map_err(|error| unreadable("content-encoding", error.to_string()))?
            .to_ascii_lowercase();

        let mut body = self.body.clone();
        for coding in codings.rsplit(',').map(str::trim).filter(|coding| !coding.is_empty()) {
            let inflated = match coding {
                "identity" => continue,
                "gzip" | "x-gzip" => inflate(GzDecoder::new(body.as_ref()), limit),
                "deflate" => inflate(ZlibDecoder::new(body.as_ref()), limit),
                other => {
                    return Err(unreadable(other, "unsupported content-encoding".to_owned()));
                }
            };
            body = inflated.map_err(|failure| match failure {
                Inflate::Corrupt(source) => unreadable(coding, source.to_string()),
                Inflate::Overflow => Error::ResponseBodyTooLarge {
                    host: host.to_owned(),
                    limit_bytes: limit,
                },
            })?;
        }

        self.body = body;
        self.head.headers.remove(CONTENT_ENCODING);
        self.head.headers.remove(CONTENT_LENGTH);
        Ok(())
    }

    fn decode_error(&self, source: Box<dyn std::error::Error + Send + Sync>) -> Error {
        Error::Decode {
            message: self
                .error_context
                .clone()
                .unwrap_or_else(|| DEFAULT_DECODE_ERROR_MESSAGE.to_owned()),
            source,
        }
    }

    pub fn json<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| self.decode_error(Box::new(source)))
    }

    /// Decodes a gzip-compressed JSON document, independent of any
    /// `Content-Encoding` header.
    pub fn gunzip_json<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let decoded = inflate(GzDecoder::new(self.body.as_ref()), MAX_GUNZIP_BYTES).map_err(
            |failure| match failure {
                Inflate::Corrupt(source) => self.decode_error(Box::new(source)),
                Inflate::Overflow => self.decode_error(
                    format!("gzip payload expands past {MAX_GUNZIP_BYTES} bytes").into(),
                ),
            },
        )?;
        serde_json::from_slice(&decoded).map_err(|source| self.decode_error(Box::new(source)))
    }

    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.head.is_success() {
            return Ok(self);
        }
        Err(Error::HttpStatus {
            status: self.head.status.as_u16(),
            url: self.head.url,
        })
    }
}

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

/// A response whose body is read incrementally.
pub struct HttpResponseStream {
    head: ResponseHead,
    body: BodyStream,
}

impl std::fmt::Debug for HttpResponseStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpResponseStream")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

impl HttpResponseStream {
    pub fn new(status: StatusCode, headers: HeaderMap, url: impl Into<String>, body: BodyStream) -> Self {
        Self {
            head: ResponseHead::new(status, headers, url),
            body,
        }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn url(&self) -> &str {
        &self.head.url
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, Error>> {
        self.body.next().await
    }

    pub async fn into_bytes(mut self) -> Result<Bytes, Error> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(collected.freeze())
    }

    /// Streams the body into `destination`, creating or truncating it, and
    /// returns the head together with the number of bytes written.
    pub async fn write_to(mut self, destination: &Path) -> Result<(ResponseHead, u64), Error> {
        let io_error = |context: &str, source| Error::Io {
            context: format!("{context} {}", destination.display()),
            source,
        };
        let file = tokio::fs::File::create(destination)
            .await
            .map_err(|source| io_error("creating", source))?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_BYTES, file);
        let mut written = 0_u64;
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|source| io_error("writing", source))?;
            written += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|source| io_error("flushing", source))?;
        Ok((self.head, written))
    }
}
