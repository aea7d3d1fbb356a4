use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{COOKIE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cookies::CookieJar;
use crate::error::Error;
use crate::request::TransportRequest;
use crate::response::{HttpResponse, HttpResponseStream, ResponseHead};
use crate::rules::RewriteRuleSet;
use crate::settings::{SessionConfig, Settings};
use crate::store::KeyValueStore;
use crate::tls::TlsProfile;
use crate::transport::{Transport, TransportFuture, TransportSession};
use crate::util::{
    is_http_url, join_base_path, lock_unpoisoned, merge_headers, parse_header_name,
    parse_header_value, redact_uri_for_logs,
};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub(crate) const DEFAULT_NO_RESPONSE_MESSAGE: &str = "no response received from the server";
const DEFAULT_BASE_URL: &str = "{}";

pub type BeforeRequestHook = Arc<dyn Fn() + Send + Sync>;
pub type AfterRequestHook = Arc<dyn Fn(&ResponseHead) + Send + Sync>;

/// Per-call knobs of [`Session::request`].
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub attempts: Option<u32>,
    pub retry_delay: Duration,
    /// Treat any non-2xx status like a transport failure.
    pub retry_not_ok: bool,
    pub return_json: Option<bool>,
    /// Message of the error raised when no usable response arrives or its
    /// JSON does not decode.
    pub error_msg: Option<String>,
    /// URL to log instead of the requested one.
    pub log_url: Option<String>,
    pub timeout: Option<Duration>,
    pub verify: Option<bool>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            attempts: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_not_ok: false,
            return_json: None,
            error_msg: None,
            log_url: None,
            timeout: None,
            verify: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn retry_not_ok(mut self, retry_not_ok: bool) -> Self {
        self.retry_not_ok = retry_not_ok;
        self
    }

    pub fn return_json(mut self, return_json: bool) -> Self {
        self.return_json = Some(return_json);
        self
    }

    pub fn error_msg(mut self, error_msg: impl Into<String>) -> Self {
        self.error_msg = Some(error_msg.into());
        self
    }

    pub fn log_url(mut self, log_url: impl Into<String>) -> Self {
        self.log_url = Some(log_url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    fn no_response_message(&self) -> String {
        self.error_msg
            .clone()
            .unwrap_or_else(|| DEFAULT_NO_RESPONSE_MESSAGE.to_owned())
    }
}

/// One kind of response the retry loop can wait for.
trait Attempt: Sized + Send {
    fn fetch(transport: &dyn Transport, request: TransportRequest) -> TransportFuture<'_, Self>;

    fn head(&self) -> &ResponseHead;

    fn set_error_context(&mut self, _message: Option<&str>) {}
}

impl Attempt for HttpResponse {
    fn fetch(transport: &dyn Transport, request: TransportRequest) -> TransportFuture<'_, Self> {
        transport.send(request)
    }

    fn head(&self) -> &ResponseHead {
        HttpResponse::head(self)
    }

    fn set_error_context(&mut self, message: Option<&str>) {
        HttpResponse::set_error_context(self, message);
    }
}

impl Attempt for HttpResponseStream {
    fn fetch(transport: &dyn Transport, request: TransportRequest) -> TransportFuture<'_, Self> {
        transport.send_stream(request)
    }

    fn head(&self) -> &ResponseHead {
        HttpResponseStream::head(self)
    }
}

type Decoder<'a, R, T> = &'a (dyn Fn(&R) -> Result<T, Error> + Sync);

pub struct SessionBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn Transport>>,
    headers: HeaderMap,
    base_url: String,
    return_json: bool,
    cookies_key: Option<String>,
    store: Option<Arc<dyn KeyValueStore>>,
    rules: RewriteRuleSet,
    proxy: Option<String>,
    tls_profile: TlsProfile,
    client_cert: Option<String>,
    auto_close: bool,
    before_request: Option<BeforeRequestHook>,
    after_request: Option<AfterRequestHook>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            config: SessionConfig::default(),
            transport: None,
            headers: HeaderMap::new(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            return_json: false,
            cookies_key: None,
            store: None,
            rules: RewriteRuleSet::new(),
            proxy: None,
            tls_profile: TlsProfile::default(),
            client_cert: None,
            auto_close: true,
            before_request: None,
            after_request: None,
        }
    }
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Takes verification, timeout, attempts and proxy defaults from user
    /// settings.
    pub fn settings(self, settings: &dyn Settings) -> Self {
        self.config(SessionConfig::from_settings(settings))
    }

    /// Sends through `transport` instead of a routed [`TransportSession`].
    /// Rules, proxy, TLS and certificate options are then ignored.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Prefix for relative URLs: a `{}` template or a base joined with a `/`.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn return_json(mut self, return_json: bool) -> Self {
        self.return_json = return_json;
        self
    }

    /// Loads cookies stored under `key` and lets [`Session::save_cookies`]
    /// write them back.
    pub fn cookies(mut self, key: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
        self.cookies_key = Some(key.into());
        self.store = Some(store);
        self
    }

    pub fn rules(mut self, rules: RewriteRuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.config.attempts = attempts.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.verify_ssl = verify;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn tls_profile(mut self, tls_profile: TlsProfile) -> Self {
        self.tls_profile = tls_profile;
        self
    }

    pub fn client_cert(mut self, client_cert: impl Into<String>) -> Self {
        self.client_cert = Some(client_cert.into());
        self
    }

    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn before_request<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_request = Some(Arc::new(hook));
        self
    }

    pub fn after_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ResponseHead) + Send + Sync + 'static,
    {
        self.after_request = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Session, Error> {
        let (transport, routed) = match self.transport {
            Some(transport) => (transport, None),
            None => {
                let mut builder = TransportSession::builder()
                    .verify(self.config.verify_ssl)
                    .timeout(self.config.timeout)
                    .rules(self.rules)
                    .tls_profile(self.tls_profile)
                    .auto_close(self.auto_close);
                if let Some(proxy) = self.proxy.or(self.config.proxy_server) {
                    builder = builder.proxy(proxy);
                }
                if let Some(client_cert) = self.client_cert {
                    builder = builder.client_cert(client_cert);
                }
                let session = builder.build()?;
                (Arc::new(session.clone()) as Arc<dyn Transport>, Some(session))
            }
        };

        let cookies = match (&self.cookies_key, &self.store) {
            (Some(key), Some(store)) => store
                .get(key)
                .map(|stored| CookieJar::from_json(&stored))
                .unwrap_or_default(),
            _ => CookieJar::new(),
        };

        Ok(Session {
            transport,
            routed,
            headers: self.headers,
            base_url: self.base_url,
            attempts: self.config.attempts.max(1),
            return_json: self.return_json,
            cookies: Mutex::new(cookies),
            cookies_key: self.cookies_key,
            store: self.store,
            before_request: self.before_request,
            after_request: self.after_request,
        })
    }
}

/// Retrying HTTP session on top of a [`Transport`].
///
/// Every call runs up to `attempts` times, sleeping `retry_delay` between
/// attempts. Transport failures are retried; the last one is returned as is.
/// Decoding failures are retried when JSON is requested, and non-2xx statuses
/// when `retry_not_ok` is set.
pub struct Session {
    transport: Arc<dyn Transport>,
    routed: Option<TransportSession>,
    headers: HeaderMap,
    base_url: String,
    attempts: u32,
    return_json: bool,
    cookies: Mutex<CookieJar>,
    cookies_key: Option<String>,
    store: Option<Arc<dyn KeyValueStore>>,
    before_request: Option<BeforeRequestHook>,
    after_request: Option<AfterRequestHook>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Session")
            .field("routed", &self.routed)
            .field("base_url", &self.base_url)
            .field("attempts", &self.attempts)
            .field("return_json", &self.return_json)
            .field("cookies_key", &self.cookies_key)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The routed transport, unless a custom one was supplied.
    pub fn transport_session(&self) -> Option<&TransportSession> {
        self.routed.as_ref()
    }

    pub fn set_before_request(&mut self, hook: Option<BeforeRequestHook>) {
        self.before_request = hook;
    }

    pub fn set_after_request(&mut self, hook: Option<AfterRequestHook>) {
        self.after_request = hook;
    }

    /// Absolute URL for `url`, applying the base URL to relative ones.
    pub fn url_for(&self, url: &str) -> String {
        if is_http_url(url) {
            url.to_owned()
        } else {
            join_base_path(&self.base_url, url)
        }
    }

    pub fn prepare(&self, method: Method, url: &str) -> TransportRequest {
        TransportRequest::new(method, self.url_for(url))
    }

    pub async fn request(
        &self,
        request: TransportRequest,
        options: &RequestOptions,
    ) -> Result<HttpResponse, Error> {
        if options.return_json.unwrap_or(self.return_json) {
            let validate: Decoder<'_, HttpResponse, serde_json::Value> = &|response| response.json();
            let (response, _) = self.execute(request, options, Some(validate)).await?;
            return Ok(response);
        }
        let (response, _) = self
            .execute::<HttpResponse, ()>(request, options, None)
            .await?;
        Ok(response)
    }

    /// Like [`Session::request`] with JSON decoding always on, returning the
    /// decoded document.
    pub async fn request_json<T>(
        &self,
        request: TransportRequest,
        options: &RequestOptions,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned + Send,
    {
        let decode: Decoder<'_, HttpResponse, T> = &|response| response.json();
        let (response, decoded) = self.execute(request, options, Some(decode)).await?;
        match decoded {
            Some(value) => Ok(value),
            None => response.json(),
        }
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, Error> {
        self.request(self.prepare(Method::GET, url), &RequestOptions::default())
            .await
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> Result<HttpResponse, Error> {
        let request = self.prepare(Method::POST, url).body(body);
        self.request(request, &RequestOptions::default()).await
    }

    pub async fn get_json<T>(&self, url: &str) -> Result<T, Error>
    where
        T: DeserializeOwned + Send,
    {
        self.request_json(self.prepare(Method::GET, url), &RequestOptions::default())
            .await
    }

    /// GETs a gzip-compressed JSON document and decodes it.
    pub async fn gz_json<T>(&self, url: &str, options: &RequestOptions) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let options = options.clone().return_json(false);
        let response = self
            .request(self.prepare(Method::GET, url), &options)
            .await?;
        response.gunzip_json()
    }

    /// Streams a response body into `destination`. Non-2xx statuses are
    /// [`Error::HttpStatus`] and leave no file behind.
    pub async fn chunked_dl(
        &self,
        method: Method,
        url: &str,
        destination: impl AsRef<Path>,
        options: &RequestOptions,
    ) -> Result<ResponseHead, Error> {
        let options = options.clone().return_json(false);
        let (stream, _) = self
            .execute::<HttpResponseStream, ()>(self.prepare(method, url), &options, None)
            .await?;
        if !stream.head().is_success() {
            return Err(Error::HttpStatus {
                status: stream.status().as_u16(),
                url: redact_uri_for_logs(stream.url()),
            });
        }
        let destination = destination.as_ref();
        let (head, written) = stream.write_to(destination).await?;
        debug!(destination = %destination.display(), bytes = written, "download complete");
        Ok(head)
    }

    async fn execute<R, T>(
        &self,
        mut request: TransportRequest,
        options: &RequestOptions,
        decode: Option<Decoder<'_, R, T>>,
    ) -> Result<(R, Option<T>), Error>
    where
        R: Attempt,
        T: Send,
    {
        request.headers = merge_headers(&self.headers, &request.headers);
        if let Some(timeout) = options.timeout {
            request.timeout = Some(timeout);
        }
        if let Some(verify) = options.verify {
            request.verify = Some(verify);
        }
        let attempts = options.attempts.unwrap_or(self.attempts).max(1);
        let log_url = options
            .log_url
            .clone()
            .unwrap_or_else(|| redact_uri_for_logs(&request.full_url()));

        for attempt in 1..=attempts {
            if attempt > 1 && !options.retry_delay.is_zero() {
                tokio::time::sleep(options.retry_delay).await;
            }
            if let Some(hook) = &self.before_request {
                hook();
            }

            let mut outgoing = request.clone();
            let cookie_url = outgoing.full_url();
            self.apply_cookies(&cookie_url, outgoing.headers_mut());
            info!(attempt, attempts, method = %outgoing.method(), url = %log_url, "sending request");
            let span = info_span!(
                "reroute.request",
                method = %outgoing.method(),
                url = %log_url,
                attempt,
                attempts
            );

            let mut response = match R::fetch(self.transport.as_ref(), outgoing)
                .instrument(span)
                .await
            {
                Ok(response) => response,
                Err(error) if error.is_transport() => {
                    if attempt == attempts {
                        return Err(error);
                    }
                    warn!(attempt, attempts, error = %error, "attempt failed, retrying");
                    continue;
                }
                Err(error) if error.is_configuration() => return Err(error),
                Err(error) => {
                    warn!(attempt, attempts, error = %error, "request failed without a response");
                    return Err(Error::NoResponse {
                        message: options.no_response_message(),
                        source: Some(Box::new(error)),
                    });
                }
            };
            self.store_cookies(&cookie_url, response.head());

            if options.retry_not_ok && !response.head().is_success() {
                debug!(
                    attempt,
                    attempts,
                    status = %response.head().status(),
                    "unsuccessful status, retrying"
                );
                continue;
            }

            response.set_error_context(options.error_msg.as_deref());
            let decoded = match decode {
                None => None,
                Some(decode) => match decode(&response) {
                    Ok(value) => Some(value),
                    Err(error) if attempt == attempts => return Err(error),
                    Err(error) => {
                        debug!(attempt, attempts, error = %error, "response did not decode, retrying");
                        continue;
                    }
                },
            };

            if let Some(hook) = &self.after_request {
                hook(response.head());
            }
            return Ok((response, decoded));
        }

        Err(Error::NoResponse {
            message: options.no_response_message(),
            source: None,
        })
    }

    fn apply_cookies(&self, url: &str, headers: &mut HeaderMap) {
        if headers.contains_key(COOKIE) {
            return;
        }
        if let Some(value) = lock_unpoisoned(&self.cookies).header_value(url) {
            headers.insert(COOKIE, value);
        }
    }

    fn store_cookies(&self, url: &str, head: &ResponseHead) {
        lock_unpoisoned(&self.cookies).store_response_cookies(url, head.headers());
    }

    pub fn cookies(&self) -> CookieJar {
        lock_unpoisoned(&self.cookies).clone()
    }

    /// Adds a cookie sent to every host.
    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        lock_unpoisoned(&self.cookies).insert(name, value);
    }

    /// Persists the cookie jar under the configured cookies key.
    pub fn save_cookies(&self) -> Result<(), Error> {
        let (Some(key), Some(store)) = (&self.cookies_key, &self.store) else {
            return Err(Error::Configuration {
                message: "a cookies key is required to save cookies".to_owned(),
            });
        };
        store.set(key, lock_unpoisoned(&self.cookies).to_json());
        Ok(())
    }

    pub fn clear_cookies(&self) {
        if let (Some(key), Some(store)) = (&self.cookies_key, &self.store) {
            store.delete(key);
        }
        lock_unpoisoned(&self.cookies).clear();
    }

    pub fn close(&self) {
        self.transport.close();
    }
}
