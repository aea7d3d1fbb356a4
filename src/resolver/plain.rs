use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;
use std::time::Instant;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::Error;
use crate::resolver::{LookupFuture, Resolver};

const DNS_PORT: u16 = 53;

/// Answers shared by every plain DNS resolver, keyed by lowercase hostname.
static DNS_CACHE: LazyLock<TtlCache<String, Vec<IpAddr>>> = LazyLock::new(TtlCache::default);

/// Classic DNS against a single nameserver.
pub struct PlainDnsResolver {
    nameservers: Vec<String>,
    resolver: TokioAsyncResolver,
}

impl std::fmt::Debug for PlainDnsResolver {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PlainDnsResolver")
            .field("nameservers", &self.nameservers)
            .finish()
    }
}

impl PlainDnsResolver {
    /// `nameserver` is an IP address, optionally with a port.
    pub fn new(nameserver: &str) -> Result<Self, Error> {
        let address = parse_nameserver(nameserver)?;
        let group = NameServerConfigGroup::from_ips_clear(&[address.ip()], address.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);

        let mut options = ResolverOpts::default();
        // answers are cached in DNS_CACHE instead
        options.cache_size = 0;
        options.ip_strategy = LookupIpStrategy::Ipv4thenIpv6;

        Ok(Self {
            nameservers: vec![nameserver.trim().to_owned()],
            resolver: TokioAsyncResolver::tokio(config, options),
        })
    }

    fn resolution_error(&self, host: &str) -> Error {
        Error::Resolution {
            host: host.to_owned(),
            nameservers: self.nameservers.clone(),
        }
    }
}

impl Resolver for PlainDnsResolver {
    fn nameservers(&self) -> &[String] {
        &self.nameservers
    }

    fn lookup<'a>(&'a self, host: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            let key = host.to_ascii_lowercase();
            if let Some(addresses) = DNS_CACHE.get(&key) {
                debug!(host = %key, "dns cache hit");
                return Ok(addresses);
            }

            let lookup = self.resolver.lookup_ip(key.as_str()).await.map_err(|error| {
                debug!(
                    host = %key,
                    nameservers = ?self.nameservers,
                    error = %error,
                    "dns lookup failed"
                );
                self.resolution_error(host)
            })?;
            let addresses = lookup.iter().collect::<Vec<_>>();
            if addresses.is_empty() {
                return Err(self.resolution_error(host));
            }

            let ttl = lookup.valid_until().saturating_duration_since(Instant::now());
            DNS_CACHE.insert(key, addresses.clone(), ttl);
            Ok(addresses)
        })
    }
}

fn parse_nameserver(nameserver: &str) -> Result<SocketAddr, Error> {
    let trimmed = nameserver.trim();
    if let Ok(address) = trimmed.parse::<SocketAddr>() {
        return Ok(address);
    }
    let bare = trimmed.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| Error::Configuration {
            message: format!("nameserver `{trimmed}` is not an ip address"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nameserver_accepts_optional_port() {
        assert_eq!(
            parse_nameserver("1.1.1.1").expect("ip"),
            "1.1.1.1:53".parse::<SocketAddr>().expect("addr")
        );
        assert_eq!(
            parse_nameserver("127.0.0.1:5353").expect("ip and port"),
            "127.0.0.1:5353".parse::<SocketAddr>().expect("addr")
        );
        assert_eq!(
            parse_nameserver("[2606:4700::1111]").expect("v6"),
            "[2606:4700::1111]:53".parse::<SocketAddr>().expect("addr")
        );
    }

    #[test]
    fn hostname_nameserver_is_rejected() {
        let error = parse_nameserver("dns.google").expect_err("not an ip");
        assert!(error.is_configuration());
    }

    #[tokio::test]
    async fn reports_nameserver_identity() {
        let resolver = PlainDnsResolver::new("9.9.9.9").expect("resolver builds");
        assert_eq!(resolver.nameservers(), ["9.9.9.9".to_owned()]);
    }
}
