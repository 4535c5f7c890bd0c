use crate::listening_point::{is_wildcard_host, normalize_host};
use hickory_resolver::{Name, TokioResolver};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::OnceCell;

/// Resolves the configured host of a listening point into the address to bind to.
///
/// IP literals, wildcards and `localhost` never touch DNS. The system resolver is only
/// created on the first name that actually needs a lookup.
#[derive(Default)]
pub struct HostResolver {
    dns: OnceCell<TokioResolver>,
}

impl HostResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given DNS resolver instead of the system configuration
    pub fn with_dns_resolver(dns_resolver: TokioResolver) -> Self {
        Self {
            dns: OnceCell::new_with(Some(dns_resolver)),
        }
    }

    #[tracing::instrument(level = "debug", err, skip(self))]
    pub async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        if is_wildcard_host(host) {
            return Ok(wildcard_of(host));
        }

        let host = normalize_host(host);

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        log::debug!("Resolving hostname {host:?}");

        let dns_resolver = self
            .dns
            .get_or_try_init(|| async {
                TokioResolver::builder_tokio().map(|builder| builder.build())
            })
            .await?;

        let name = Name::from_utf8(&host)?;
        let lookup = dns_resolver.lookup_ip(name).await?;

        // bind to IPv4 if the host has both
        let ip = lookup
            .iter()
            .find(IpAddr::is_ipv4)
            .or_else(|| lookup.iter().next());

        ip.ok_or_else(|| io::Error::other(format!("No DNS records for host '{host}' found")))
    }
}

fn wildcard_of(host: &str) -> IpAddr {
    match normalize_host(host).parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }
}
