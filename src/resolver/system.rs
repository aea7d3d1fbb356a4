use std::io;
use std::net::IpAddr;

/// System lookup that only falls back to IPv6 when the host has no IPv4
/// address at all.
pub(crate) async fn lookup_preferring_ipv4(host: &str) -> io::Result<Vec<IpAddr>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let (ipv4, ipv6) = lookup_all(bare, 0).await?;
    if !ipv4.is_empty() {
        return Ok(ipv4);
    }
    if !ipv6.is_empty() {
        return Ok(ipv6);
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no addresses found for {bare}"),
    ))
}

/// Every address of `host`, split by family and deduplicated.
pub(crate) async fn lookup_all(host: &str, port: u16) -> io::Result<(Vec<IpAddr>, Vec<IpAddr>)> {
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    for address in tokio::net::lookup_host((host, port)).await? {
        let ip = address.ip();
        let family = if ip.is_ipv4() { &mut ipv4 } else { &mut ipv6 };
        if !family.contains(&ip) {
            family.push(ip);
        }
    }
    Ok((ipv4, ipv6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_addresses_skip_the_system_resolver() {
        let addresses = lookup_preferring_ipv4("10.1.2.3").await.expect("literal");
        assert_eq!(addresses, vec!["10.1.2.3".parse::<IpAddr>().expect("ip")]);

        let addresses = lookup_preferring_ipv4("[::1]").await.expect("literal");
        assert_eq!(addresses, vec!["::1".parse::<IpAddr>().expect("ip")]);
    }

    #[tokio::test]
    async fn localhost_prefers_ipv4() {
        let addresses = lookup_preferring_ipv4("localhost").await.expect("localhost");
        assert!(addresses.iter().all(IpAddr::is_ipv4) || addresses.iter().all(IpAddr::is_ipv6));
        assert!(!addresses.is_empty());
    }
}
