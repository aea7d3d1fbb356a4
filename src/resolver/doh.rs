use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use http::header::{ACCEPT, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::Error;
use crate::request::TransportRequest;
use crate::resolver::system::lookup_all;
use crate::resolver::{LookupFuture, Resolver};
use crate::transport::TransportSession;

const RECORD_A: u16 = 1;
const RECORD_AAAA: u16 = 28;

/// Answers shared by every DoH resolver, keyed by `(server, host)`.
static DOH_CACHE: LazyLock<TtlCache<(String, String), Vec<IpAddr>>> =
    LazyLock::new(TtlCache::default);

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DohAnswer {
    #[serde(rename = "type")]
    pub(crate) record_type: u16,
    pub(crate) data: String,
    #[serde(rename = "TTL", default)]
    pub(crate) ttl: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct DohResponse {
    #[serde(rename = "Answer", default)]
    pub(crate) answer: Vec<DohAnswer>,
}

/// Address answers of a DoH document and the smallest TTL among them.
pub(crate) fn usable_answers(response: &DohResponse) -> Option<(Vec<IpAddr>, Duration)> {
    let suitable = response
        .answer
        .iter()
        .filter(|answer| matches!(answer.record_type, RECORD_A | RECORD_AAAA))
        .filter_map(|answer| {
            answer
                .data
                .parse::<IpAddr>()
                .ok()
                .map(|ip| (ip, answer.ttl))
        })
        .collect::<Vec<_>>();
    let ttl = suitable.iter().map(|(_, ttl)| *ttl).min()?;
    let addresses = suitable.into_iter().map(|(ip, _)| ip).collect();
    Some((addresses, Duration::from_secs(ttl)))
}

/// DNS-over-HTTPS using the JSON API (`application/dns-json`).
///
/// Servers are tried in order; the first one returning usable answers wins.
#[derive(Debug)]
pub struct DohResolver {
    nameservers: Vec<String>,
    session: TransportSession,
}

impl DohResolver {
    pub fn new<I, S>(nameservers: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nameservers = nameservers.into_iter().map(Into::into).collect::<Vec<_>>();
        if nameservers.is_empty() {
            return Err(Error::Configuration {
                message: "doh resolver needs at least one server".to_owned(),
            });
        }
        Ok(Self {
            nameservers,
            session: TransportSession::builder().build()?,
        })
    }

    async fn record_type_for(server: &str) -> &'static str {
        let Ok(url) = url::Url::parse(server) else {
            return "A";
        };
        let Some(server_host) = url.host_str() else {
            return "A";
        };
        let port = url.port_or_known_default().unwrap_or(443);
        match lookup_all(server_host, port).await {
            Ok((ipv4, ipv6)) if ipv4.is_empty() && !ipv6.is_empty() => "AAAA",
            _ => "A",
        }
    }

    async fn query(&self, server: &str, host: &str) -> Result<(Vec<IpAddr>, Duration), Error> {
        let record_type = Self::record_type_for(server).await;
        debug!(server = %server, host = %host, record_type, "doh query");

        let request = TransportRequest::get(server)
            .query_pair("name", host)
            .query_pair("type", record_type)
            .header(ACCEPT, HeaderValue::from_static("application/dns-json"));
        let document = self.session.request(request).await?.json::<DohResponse>()?;
        usable_answers(&document).ok_or_else(|| Error::Resolution {
            host: host.to_owned(),
            nameservers: vec![server.to_owned()],
        })
    }
}

impl Resolver for DohResolver {
    fn nameservers(&self) -> &[String] {
        &self.nameservers
    }

    fn lookup<'a>(&'a self, host: &'a str) -> LookupFuture<'a> {
        Box::pin(async move {
            for server in &self.nameservers {
                let key = (server.clone(), host.to_ascii_lowercase());
                if let Some(addresses) = DOH_CACHE.get(&key) {
                    return Ok(addresses);
                }

                match self.query(server, host).await {
                    Ok((addresses, ttl)) if !addresses.is_empty() => {
                        DOH_CACHE.insert(key, addresses.clone(), ttl);
                        return Ok(addresses);
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        debug!(server = %server, host = %host, error = %error, "doh query failed");
                    }
                }
            }

            Err(Error::Resolution {
                host: host.to_owned(),
                nameservers: self.nameservers.clone(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(document: &str) -> DohResponse {
        serde_json::from_str(document).expect("document parses")
    }

    #[test]
    fn ttl_is_the_smallest_among_address_answers() {
        let document = parse(
            r#"{"Status":0,"Answer":[
                {"name":"cdn.example.com","type":5,"TTL":10,"data":"edge.example.net."},
                {"name":"edge.example.net","type":1,"TTL":300,"data":"203.0.113.7"},
                {"name":"edge.example.net","type":1,"TTL":60,"data":"203.0.113.8"}
            ]}"#,
        );
        let (addresses, ttl) = usable_answers(&document).expect("answers");
        assert_eq!(
            addresses,
            vec![
                "203.0.113.7".parse::<IpAddr>().expect("ip"),
                "203.0.113.8".parse::<IpAddr>().expect("ip"),
            ]
        );
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn ipv6_answers_are_usable() {
        let document =
            parse(r#"{"Answer":[{"name":"v6.example.com","type":28,"TTL":30,"data":"2001:db8::1"}]}"#);
        let (addresses, _) = usable_answers(&document).expect("answers");
        assert_eq!(addresses, vec!["2001:db8::1".parse::<IpAddr>().expect("ip")]);
    }

    #[test]
    fn missing_or_cname_only_answers_are_unusable() {
        assert!(usable_answers(&parse(r#"{"Status":3}"#)).is_none());
        let document =
            parse(r#"{"Answer":[{"name":"a.example.com","type":5,"TTL":30,"data":"b.example.com."}]}"#);
        assert!(usable_answers(&document).is_none());
    }

    #[test]
    fn resolver_requires_a_server() {
        let error = DohResolver::new(Vec::<String>::new()).expect_err("no servers");
        assert!(error.is_configuration());
    }
}
