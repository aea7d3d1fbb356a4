//! `reroute` sends HTTP requests whose connection target is decided per URL by
//! rewrite rules: a literal DNS answer, an alternate resolver (plain DNS or
//! DNS-over-HTTPS), a proxy, a source interface or a rewritten URL.
//!
//! Connections are pooled per connection identity, so two requests only share
//! a socket when scheme, host, port, resolved address, TLS profile, proxy,
//! source address and client certificate all agree.
//!
//! # Quick Start
//!
//! ```no_run
//! use reroute::prelude::{RequestOptions, RewriteRuleSet, Session};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Status {
//!     ok: bool,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rules = RewriteRuleSet::parse([
//!         ["10.0.0.7", "*api.example.com*"],
//!         ["r:https://dns.example.net/dns-query", "*cdn.example.com*"],
//!     ])?;
//!     let session = Session::builder()
//!         .base_url("https://api.example.com/v1")
//!         .rules(rules)
//!         .attempts(3)
//!         .build()?;
//!
//!     let status: Status = session.get_json("status").await?;
//!     println!("ok={}", status.ok);
//!
//!     let options = RequestOptions::new().retry_not_ok(true).error_msg("catalog unavailable");
//!     let catalog = session
//!         .request(session.prepare(http::Method::GET, "catalog"), &options)
//!         .await?;
//!     println!("{} bytes", catalog.body().len());
//!     Ok(())
//! }
//! ```
//!
//! # Rule rows
//!
//! Each row is a list of strings whose last entry is a URL glob. The other
//! entries are actions: `p:` proxy, `r:` resolver, `i:` interface address, a
//! leading digit a literal DNS answer, anything else a URL substitution for
//! the matched part.

mod cache;
mod cookies;
mod error;
mod identity;
mod policy;
mod proxy;
mod registry;
mod request;
mod resolver;
mod response;
mod rules;
mod session;
mod settings;
mod store;
mod tls;
mod transport;
mod util;

pub use crate::cookies::CookieJar;
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::identity::PoolKey;
pub use crate::policy::{DnsRewrite, PolicyResolver, ResolverOverride, SessionPolicy};
pub use crate::proxy::ProxyConfig;
pub use crate::registry::{close_sessions, open_session_count};
pub use crate::request::TransportRequest;
pub use crate::resolver::{DohResolver, LookupFuture, PlainDnsResolver, Resolver};
pub use crate::response::{HttpResponse, HttpResponseStream, ResponseHead};
pub use crate::rules::{RewriteAction, RewriteRule, RewriteRuleSet};
pub use crate::session::{
    AfterRequestHook, BeforeRequestHook, DEFAULT_RETRY_DELAY, RequestOptions, Session,
    SessionBuilder,
};
pub use crate::settings::{
    HTTP_RETRIES_KEY, HTTP_TIMEOUT_KEY, MapSettings, PROXY_SERVER_KEY, SessionConfig, Settings,
    VERIFY_SSL_KEY,
};
pub use crate::store::{KeyValueStore, MemoryStore};
pub use crate::tls::{TlsFingerprint, TlsOptionFlags, TlsProfile};
pub use crate::transport::{
    DEFAULT_USER_AGENT, Transport, TransportFuture, TransportSession, TransportSessionBuilder,
};

pub type RerouteResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CookieJar, DohResolver, Error, ErrorCode, HttpResponse, HttpResponseStream, KeyValueStore,
        MapSettings, MemoryStore, PlainDnsResolver, PolicyResolver, PoolKey, ProxyConfig,
        RequestOptions, RerouteResult, Resolver, ResolverOverride, ResponseHead, RewriteAction,
        RewriteRule, RewriteRuleSet, Session, SessionBuilder, SessionConfig, SessionPolicy,
        Settings, TlsOptionFlags, TlsProfile, Transport, TransportErrorKind, TransportRequest,
        TransportSession, TransportSessionBuilder, close_sessions, open_session_count,
    };
}
