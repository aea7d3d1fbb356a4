//! Connection identity: which pooled client a request may use, and how that
//! client finds and dials its destination.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Uri;
use http_body_util::Full;
use hyper_rustls::{HttpsConnectorBuilder, MaybeHttpsStream};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::dns::Name;
use hyper_util::rt::TokioExecutor;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tower_service::Service;
use tracing::{debug, warn};

use crate::error::Error;
use crate::policy::SessionPolicy;
use crate::proxy::{ProxyConfig, ProxyConnector};
use crate::resolver::Resolver;
use crate::resolver::system::lookup_preferring_ipv4;
use crate::tls::{TlsFingerprint, TlsProfile, build_client_config};
use crate::util::lock_unpoisoned;

pub(crate) type RoutedConnector = HandshakeObserver<hyper_rustls::HttpsConnector<ProxyConnector>>;
pub(crate) type TransportClient = Client<RoutedConnector, Full<Bytes>>;

#[derive(Clone, Debug)]
pub(crate) enum RouteTarget {
    Literal(String),
    Resolver(Arc<dyn Resolver>),
}

/// Address override for exactly one hostname.
#[derive(Clone, Debug)]
pub(crate) struct RouteOverride {
    host: String,
    target: RouteTarget,
}

impl RouteOverride {
    pub(crate) fn new(host: &str, target: RouteTarget) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            target,
        }
    }

    pub(crate) fn target(&self) -> &RouteTarget {
        &self.target
    }
}

/// Host to hand to the system resolver for `requested`.
pub(crate) async fn routed_host(requested: &str, route: Option<&RouteOverride>) -> String {
    let Some(route) = route.filter(|route| route.host.eq_ignore_ascii_case(requested)) else {
        return requested.to_owned();
    };
    match &route.target {
        RouteTarget::Literal(target) => {
            debug!(host = %requested, target = %target, "dns rewrite");
            target.clone()
        }
        RouteTarget::Resolver(resolver) => match resolver.lookup(requested).await {
            Ok(addresses) => match addresses.first() {
                Some(address) => {
                    debug!(
                        host = %requested,
                        nameservers = ?resolver.nameservers(),
                        address = %address,
                        "dns resolver override"
                    );
                    address.to_string()
                }
                None => requested.to_owned(),
            },
            Err(error) => {
                warn!(
                    host = %requested,
                    error = %error,
                    "resolver override failed, falling back to system dns"
                );
                requested.to_owned()
            }
        },
    }
}

/// hyper DNS hook applying a [`RouteOverride`] before the system lookup.
#[derive(Clone, Debug, Default)]
pub(crate) struct RoutingResolver {
    route: Option<Arc<RouteOverride>>,
}

impl RoutingResolver {
    pub(crate) fn new(route: Option<RouteOverride>) -> Self {
        Self {
            route: route.map(Arc::new),
        }
    }
}

impl Service<Name> for RoutingResolver {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let route = self.route.clone();
        Box::pin(async move {
            let host = routed_host(name.as_str(), route.as_deref()).await;
            // the connector fills in the port
            let addresses = lookup_preferring_ipv4(&host)
                .await?
                .into_iter()
                .map(|ip| SocketAddr::new(ip, 0))
                .collect::<Vec<_>>();
            Ok(addresses.into_iter())
        })
    }
}

/// Logs the negotiated cipher of every TLS connection.
#[derive(Clone, Debug)]
pub(crate) struct HandshakeObserver<C> {
    inner: C,
}

impl<C> HandshakeObserver<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C, T> Service<Uri> for HandshakeObserver<C>
where
    C: Service<Uri, Response = MaybeHttpsStream<T>>,
    C::Future: Send + 'static,
    C::Error: Send + 'static,
    T: Send + 'static,
{
    type Response = MaybeHttpsStream<T>;
    type Error = C::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let host = dst.host().unwrap_or_default().to_owned();
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            let connection = connecting.await?;
            if let MaybeHttpsStream::Https(stream) = &connection {
                let (_, session) = stream.inner().get_ref();
                debug!(
                    host = %host,
                    cipher = ?session.negotiated_cipher_suite().map(|suite| suite.suite()),
                    version = ?session.protocol_version(),
                    "tls handshake complete"
                );
            }
            Ok(connection)
        })
    }
}

/// Connection settings that are not part of a rewrite rule.
#[derive(Clone, Debug)]
pub(crate) struct RouteSettings {
    pub(crate) tls: TlsProfile,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) client_cert: Option<PathBuf>,
    pub(crate) verify: bool,
}

/// Everything that makes two connections interchangeable. Requests with
/// different keys never share a socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub tls: TlsFingerprint,
    pub source_address: Option<IpAddr>,
    /// Literal rewrite target or resolver nameserver the host is routed by.
    pub server_hostname: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub client_cert: Option<PathBuf>,
    pub verify: bool,
}

impl PoolKey {
    pub(crate) fn for_request(
        uri: &Uri,
        policy: &SessionPolicy,
        settings: &RouteSettings,
    ) -> Result<Self, Error> {
        let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidUri {
                uri: uri.to_string(),
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let server_hostname = match (&policy.dns_rewrite, &policy.resolver_override) {
            (Some(rewrite), _) if rewrite.host.eq_ignore_ascii_case(&host) => {
                Some(rewrite.target.clone())
            }
            (_, Some(resolver)) if resolver.host.eq_ignore_ascii_case(&host) => {
                resolver.resolver.nameservers().first().cloned()
            }
            _ => None,
        };

        Ok(Self {
            scheme,
            host,
            port,
            tls: settings.tls.fingerprint(),
            source_address: policy.interface_ip,
            server_hostname,
            proxy: settings.proxy.clone(),
            client_cert: settings.client_cert.clone(),
            verify: settings.verify,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolLimits {
    pub(crate) connect_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_idle_per_host: usize,
}

/// Inputs of a rustls client configuration; pools differing only in routing
/// share one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TlsConfigKey {
    tls: TlsFingerprint,
    verify: bool,
    client_cert: Option<PathBuf>,
}

impl TlsConfigKey {
    fn of(key: &PoolKey) -> Self {
        Self {
            tls: key.tls.clone(),
            verify: key.verify,
            client_cert: key.client_cert.clone(),
        }
    }
}

fn build_client(
    key: &PoolKey,
    route: Option<RouteOverride>,
    settings: &RouteSettings,
    tls_config: rustls::ClientConfig,
    limits: PoolLimits,
) -> Result<TransportClient, Error> {
    let mut http = HttpConnector::new_with_resolver(RoutingResolver::new(route));
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(limits.connect_timeout));
    http.set_local_address(key.source_address);

    let connector = ProxyConnector::new(http, settings.proxy.as_ref());
    let https = HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(connector);

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(limits.idle_timeout)
        .pool_max_idle_per_host(limits.max_idle_per_host)
        .build(HandshakeObserver::new(https)))
}

/// Owns the pooled clients of one session and the window in which routing
/// decisions of a request are in force.
pub(crate) struct ConnectionIdentityAdapter {
    clients: Mutex<HashMap<PoolKey, TransportClient>>,
    tls_configs: Mutex<HashMap<TlsConfigKey, rustls::ClientConfig>>,
    window: AsyncMutex<()>,
    limits: PoolLimits,
}

impl std::fmt::Debug for ConnectionIdentityAdapter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ConnectionIdentityAdapter")
            .field("pools", &self.pool_count())
            .field("tls_configs", &self.tls_config_count())
            .field("limits", &self.limits)
            .finish()
    }
}

/// Routing decisions of one request; released when dropped.
pub(crate) struct ActiveRoute<'a> {
    _window: AsyncMutexGuard<'a, ()>,
    key: PoolKey,
    client: TransportClient,
}

impl ActiveRoute<'_> {
    pub(crate) fn client(&self) -> &TransportClient {
        &self.client
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }
}

impl Drop for ActiveRoute<'_> {
    fn drop(&mut self) {
        debug!(host = %self.key.host, "routing window released");
    }
}

impl ConnectionIdentityAdapter {
    pub(crate) fn new(limits: PoolLimits) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            tls_configs: Mutex::new(HashMap::new()),
            window: AsyncMutex::new(()),
            limits,
        }
    }

    pub(crate) async fn activate(
        &self,
        uri: &Uri,
        policy: &SessionPolicy,
        settings: &RouteSettings,
    ) -> Result<ActiveRoute<'_>, Error> {
        let window = self.window.lock().await;
        let key = PoolKey::for_request(uri, policy, settings)?;
        let client = {
            let mut clients = lock_unpoisoned(&self.clients);
            match clients.get(&key) {
                Some(client) => client.clone(),
                None => {
                    let tls_config = self.tls_config(&key, settings)?;
                    let client = build_client(
                        &key,
                        policy.route_for(&key.host),
                        settings,
                        tls_config,
                        self.limits,
                    )?;
                    debug!(
                        host = %key.host,
                        port = key.port,
                        server_hostname = ?key.server_hostname,
                        source_address = ?key.source_address,
                        "new connection pool"
                    );
                    clients.insert(key.clone(), client.clone());
                    client
                }
            }
        };

        Ok(ActiveRoute {
            _window: window,
            key,
            client,
        })
    }

    fn tls_config(
        &self,
        key: &PoolKey,
        settings: &RouteSettings,
    ) -> Result<rustls::ClientConfig, Error> {
        let mut configs = lock_unpoisoned(&self.tls_configs);
        let config_key = TlsConfigKey::of(key);
        if let Some(config) = configs.get(&config_key) {
            return Ok(config.clone());
        }
        let config = build_client_config(
            &settings.tls,
            settings.verify,
            settings.client_cert.as_deref(),
        )?;
        configs.insert(config_key, config.clone());
        Ok(config)
    }

    pub(crate) fn pool_count(&self) -> usize {
        lock_unpoisoned(&self.clients).len()
    }

    pub(crate) fn tls_config_count(&self) -> usize {
        lock_unpoisoned(&self.tls_configs).len()
    }

    /// Drops every pooled client, closing idle connections.
    pub(crate) fn close(&self) {
        lock_unpoisoned(&self.clients).clear();
        lock_unpoisoned(&self.tls_configs).clear();
    }
}
