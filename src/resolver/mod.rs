//! Hostname resolvers selected by `r:` rewrite entries.
//!
//! A resolver never decides routing on its own: it only turns a hostname into
//! addresses. [`PlainDnsResolver`] talks classic DNS to one nameserver,
//! [`DohResolver`] queries DNS-over-HTTPS JSON endpoints. Both keep their
//! answers in process-wide TTL caches shared by every session.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::util::is_http_url;

mod doh;
mod plain;
pub(crate) mod system;

pub use doh::DohResolver;
pub use plain::PlainDnsResolver;

pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, Error>> + Send + 'a>>;

pub trait Resolver: Send + Sync + std::fmt::Debug {
    /// Nameserver identities, in query order.
    fn nameservers(&self) -> &[String];

    /// Resolves `host` to its addresses, first address preferred.
    fn lookup<'a>(&'a self, host: &'a str) -> LookupFuture<'a>;
}

/// Builds the resolver named by a `r:` entry: URLs select DoH, anything else
/// is a plain DNS nameserver.
pub(crate) fn resolver_for(nameserver: &str) -> Result<Arc<dyn Resolver>, Error> {
    if is_http_url(nameserver) {
        Ok(Arc::new(DohResolver::new([nameserver])?))
    } else {
        Ok(Arc::new(PlainDnsResolver::new(nameserver)?))
    }
}
