use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::Uri;
use http::header::HeaderValue;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tower_service::Service;
use url::Url;

use crate::error::Error;
use crate::identity::RoutingResolver;

pub(crate) type BoxConnectError = Box<dyn StdError + Send + Sync>;

type RoutedHttpConnector = HttpConnector<RoutingResolver>;

/// An HTTP proxy with any credentials split out of the URI.
#[derive(Clone)]
pub struct ProxyConfig {
    uri: Uri,
    authorization: Option<HeaderValue>,
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProxyConfig")
            .field("uri", &self.redacted())
            .finish()
    }
}

impl PartialEq for ProxyConfig {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
            && self.username == other.username
            && self.password == other.password
    }
}

impl Eq for ProxyConfig {}

impl std::hash::Hash for ProxyConfig {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
        self.username.hash(state);
        self.password.hash(state);
    }
}

impl ProxyConfig {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let trimmed = text.trim();
        let candidate = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("http://{trimmed}")
        };
        let invalid = |message: &str| Error::InvalidProxy {
            proxy: redact_proxy_text(trimmed),
            message: message.to_owned(),
        };

        let url = Url::parse(&candidate).map_err(|_| invalid("not a valid url"))?;
        // the proxy hop itself is always plain tcp
        if !url.scheme().eq_ignore_ascii_case("http") {
            return Err(invalid("only http proxies are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let uri = format!("http://{host}:{port}")
            .parse::<Uri>()
            .map_err(|_| invalid("not a valid uri"))?;

        let username = percent_decoded(url.username());
        let password = url.password().and_then(percent_decoded);
        let authorization = match &username {
            Some(username) => {
                let credentials = format!("{username}:{}", password.as_deref().unwrap_or(""));
                let mut value =
                    HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(credentials)))
                        .map_err(|_| invalid("credentials are not header safe"))?;
                value.set_sensitive(true);
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            uri,
            authorization,
            username,
            password,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub(crate) fn authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }

    /// Proxy URL safe for logs: credentials are replaced by placeholders.
    pub fn redacted(&self) -> String {
        let scheme = self.uri.scheme_str().unwrap_or("http");
        let host = self.uri.host().unwrap_or_default();
        let port = self.uri.port_u16().unwrap_or(80);
        if self.username.is_some() {
            format!("{scheme}://username:password@{host}:{port}")
        } else {
            format!("{scheme}://{host}:{port}")
        }
    }

    /// Removes every credential fragment from `text`.
    pub fn scrub(&self, text: &str) -> String {
        let mut scrubbed = text.to_owned();
        for secret in [&self.password, &self.username].into_iter().flatten() {
            if !secret.is_empty() {
                scrubbed = scrubbed.replace(secret.as_str(), "<redacted>");
            }
        }
        scrubbed
    }
}

fn percent_decoded(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    Some(
        // `+` is literal in userinfo
        url::form_urlencoded::parse(format!("v={}", text.replace('+', "%2B")).as_bytes())
            .next()
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| text.to_owned()),
    )
}

/// Strips userinfo from a raw proxy string that could not be parsed.
pub(crate) fn redact_proxy_text(text: &str) -> String {
    match text.rsplit_once('@') {
        Some((prefix, host)) => {
            let scheme = prefix
                .split_once("://")
                .map(|(scheme, _)| format!("{scheme}://"))
                .unwrap_or_default();
            format!("{scheme}username:password@{host}")
        }
        None => text.to_owned(),
    }
}

#[derive(Debug)]
pub(crate) struct ProxyConnection<T> {
    inner: T,
    proxied: bool,
}

impl<T> ProxyConnection<T> {
    fn new(inner: T, proxied: bool) -> Self {
        Self { inner, proxied }
    }
}

impl<T> HyperRead for ProxyConnection<T>
where
    T: HyperRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_read(cx, buf)
    }
}

impl<T> HyperWrite for ProxyConnection<T>
where
    T: HyperWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<Result<usize, std::io::Error>> {
        let inner = &mut self.get_mut().inner;
        Pin::new(inner).poll_write_vectored(cx, bufs)
    }
}

impl<T> Connection for ProxyConnection<T>
where
    T: Connection,
{
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.proxied)
    }
}

#[derive(Clone)]
struct ProxyRuntime {
    tunnel: Tunnel<RoutedHttpConnector>,
    proxy_uri: Uri,
}

/// Connects directly, or through an HTTP proxy: `CONNECT` tunnels for https
/// and absolute-form requests for plain http.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    direct: RoutedHttpConnector,
    proxy: Option<ProxyRuntime>,
}

impl ProxyConnector {
    pub(crate) fn new(direct: RoutedHttpConnector, proxy_config: Option<&ProxyConfig>) -> Self {
        let proxy = proxy_config.map(|config| {
            let mut tunnel = Tunnel::new(config.uri.clone(), direct.clone());
            if let Some(authorization) = config.authorization.clone() {
                tunnel = tunnel.with_auth(authorization);
            }
            ProxyRuntime {
                tunnel,
                proxy_uri: config.uri.clone(),
            }
        });
        Self { direct, proxy }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyConnection<<RoutedHttpConnector as Service<Uri>>::Response>;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if let Some(proxy) = &mut self.proxy {
            let direct_ready = match self.direct.poll_ready(cx) {
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
                Poll::Pending => false,
            };
            let tunnel_ready = match proxy.tunnel.poll_ready(cx) {
                Poll::Ready(Ok(())) => true,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(Box::new(error))),
                Poll::Pending => false,
            };
            return if direct_ready && tunnel_ready {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            };
        }

        match self.direct.poll_ready(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(error)) => Poll::Ready(Err(Box::new(error))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        if let Some(proxy) = &mut self.proxy {
            let scheme = dst.scheme_str().unwrap_or_default();
            if scheme.eq_ignore_ascii_case("https") {
                let tunnel_target = normalize_tunnel_target_uri(dst);
                let connecting = proxy.tunnel.call(tunnel_target);
                return Box::pin(async move {
                    connecting
                        .await
                        .map(|connection| ProxyConnection::new(connection, false))
                        .map_err(|error| Box::new(error) as _)
                });
            }
            let connecting = self.direct.call(proxy.proxy_uri.clone());
            return Box::pin(async move {
                connecting
                    .await
                    .map(|connection| ProxyConnection::new(connection, true))
                    .map_err(|error| Box::new(error) as _)
            });
        }

        let connecting = self.direct.call(dst);
        Box::pin(async move {
            connecting
                .await
                .map(|connection| ProxyConnection::new(connection, false))
                .map_err(|error| Box::new(error) as _)
        })
    }
}

pub(crate) fn normalize_tunnel_target_uri(dst: Uri) -> Uri {
    if dst.port().is_some() {
        return dst;
    }

    let Some(scheme) = dst.scheme_str() else {
        return dst;
    };
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        443
    } else if scheme.eq_ignore_ascii_case("http") {
        80
    } else {
        return dst;
    };
    let Some(host) = dst.host() else {
        return dst;
    };
    let authority_text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{default_port}")
    } else {
        format!("{host}:{default_port}")
    };

    let Ok(authority) = authority_text.parse() else {
        return dst;
    };
    let original = dst.clone();
    let mut parts = dst.into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(original)
}
