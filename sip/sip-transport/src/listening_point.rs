use parking_lot::RwLock;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// Transport protocol of a listening point.
///
/// TLS chains listen with [`Transport::Tcp`], the TLS layer sits above this crate.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }

    /// Case insensitive comparison with a transport name (e.g. taken from configuration)
    pub fn matches(&self, name: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown transport {0:?}")]
pub struct UnknownTransport(String);

impl FromStr for Transport {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Transport::Tcp.matches(s) {
            Ok(Transport::Tcp)
        } else if Transport::Udp.matches(s) {
            Ok(Transport::Udp)
        } else {
            Err(UnknownTransport(s.into()))
        }
    }
}

/// A configured signalling endpoint: `(host, port, transport)`.
///
/// The port is rewritten once the listener is bound, so a listening point configured
/// with port 0 reports the port the OS assigned afterwards.
#[derive(Debug)]
pub struct ListeningPoint {
    host: String,
    port: AtomicU16,
    transport: Transport,
}

impl ListeningPoint {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port: AtomicU16::new(port),
            transport,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub(crate) fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Release);
    }

    /// Returns true if the host is a wildcard address
    pub fn is_wildcard(&self) -> bool {
        is_wildcard_host(&self.host)
    }
}

impl fmt::Display for ListeningPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port(), self.transport)
    }
}

pub(crate) fn is_wildcard_host(host: &str) -> bool {
    match host.trim() {
        "" | "*" => true,
        host => normalize_host(host)
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_unspecified()),
    }
}

/// Bring a host into a comparable form.
///
/// IP literals are printed canonically (IPv4-mapped IPv6 addresses collapse to IPv4),
/// names are lowercased without a trailing dot. `localhost` maps to the IPv4 loopback.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return normalize_ip(ip).to_string();
    }

    let name = host.trim_end_matches('.').to_ascii_lowercase();

    if name == "localhost" {
        Ipv4Addr::LOCALHOST.to_string()
    } else {
        name
    }
}

fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        ip => ip,
    }
}

/// Select the listening point a connection with the local address `local` belongs to.
///
/// Only points with matching port and transport are considered. A point whose host equals
/// the connection's local host wins immediately. Without such an exact match the first
/// candidate in iteration order is returned, registries must therefore iterate in
/// registration order.
pub fn select_listening_point<'a, T, I, F>(
    items: I,
    local: SocketAddr,
    transport: Transport,
    point: F,
) -> Option<&'a T>
where
    I: IntoIterator<Item = &'a T>,
    F: Fn(&T) -> &ListeningPoint,
{
    let local_host = normalize_ip(local.ip()).to_string();
    let mut fallback = None;

    for item in items {
        let lp = point(item);

        if lp.port() != local.port() || lp.transport() != transport {
            continue;
        }

        if normalize_host(lp.host()) == local_host {
            return Some(item);
        }

        if fallback.is_none() {
            fallback = Some(item);
        }
    }

    if let Some(item) = fallback {
        log::debug!(
            "no listening point matches {local}/{transport} exactly, using default {}",
            point(item)
        );
    }

    fallback
}

/// Insertion ordered registry of entries carrying a listening point.
///
/// Readers work on snapshots and never block registration for longer than a clone.
pub(crate) struct ListeningPoints<T> {
    entries: RwLock<Vec<Arc<T>>>,
}

impl<T> Default for ListeningPoints<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: AsRef<ListeningPoint>> ListeningPoints<T> {
    pub(crate) fn insert(&self, entry: Arc<T>) {
        self.entries.write().push(entry);
    }

    /// Remove the entry of `point`, identified by pointer
    pub(crate) fn remove(&self, point: &ListeningPoint) -> Option<Arc<T>> {
        let mut entries = self.entries.write();
        let index = entries
            .iter()
            .position(|entry| std::ptr::eq((**entry).as_ref(), point))?;

        Some(entries.remove(index))
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.read().clone()
    }

    pub(crate) fn find(&self, local: SocketAddr, transport: Transport) -> Option<Arc<T>> {
        let snapshot = self.snapshot();

        select_listening_point(&snapshot, local, transport, |entry| (**entry).as_ref()).cloned()
    }
}

impl AsRef<ListeningPoint> for ListeningPoint {
    fn as_ref(&self) -> &ListeningPoint {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp(host: &str, port: u16, transport: Transport) -> Arc<ListeningPoint> {
        Arc::new(ListeningPoint::new(host, port, transport))
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_host("LocalHost."), "127.0.0.1");
        assert_eq!(normalize_host("Example.COM."), "example.com");
        assert_eq!(normalize_host("[::ffff:10.0.0.1]"), "10.0.0.1");
        assert_eq!(normalize_host("::1"), "::1");
        assert_eq!(normalize_host(" 192.168.0.1 "), "192.168.0.1");
    }

    #[test]
    fn wildcard() {
        assert!(lp("0.0.0.0", 0, Transport::Tcp).is_wildcard());
        assert!(lp("::", 0, Transport::Tcp).is_wildcard());
        assert!(lp("*", 0, Transport::Tcp).is_wildcard());
        assert!(!lp("127.0.0.1", 0, Transport::Tcp).is_wildcard());
    }

    #[test]
    fn transport_from_str() {
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("Udp".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("sctp".parse::<Transport>().is_err());
    }

    #[test]
    fn exact_host_wins_over_earlier_candidate() {
        let points = [
            lp("10.0.0.2", 8000, Transport::Tcp),
            lp("10.0.0.1", 8000, Transport::Tcp),
        ];

        let local: SocketAddr = "10.0.0.1:8000".parse().unwrap();
        let found = select_listening_point(&points, local, Transport::Tcp, |p| &**p).unwrap();

        assert_eq!(found.host(), "10.0.0.1");
    }

    #[test]
    fn first_registered_is_the_fallback() {
        let points = [
            lp("10.0.0.2", 8000, Transport::Tcp),
            lp("10.0.0.3", 8000, Transport::Tcp),
        ];

        let local: SocketAddr = "10.0.0.1:8000".parse().unwrap();
        let found = select_listening_point(&points, local, Transport::Tcp, |p| &**p).unwrap();

        assert_eq!(found.host(), "10.0.0.2");
    }

    #[test]
    fn port_and_transport_must_match() {
        let points = [
            lp("10.0.0.1", 8000, Transport::Udp),
            lp("10.0.0.1", 8001, Transport::Tcp),
        ];

        let local: SocketAddr = "10.0.0.1:8000".parse().unwrap();

        assert!(select_listening_point(&points, local, Transport::Tcp, |p| &**p).is_none());
    }

    #[test]
    fn rewritten_port_is_matched() {
        let point = lp("127.0.0.1", 0, Transport::Udp);
        point.set_port(40000);

        let local: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let points = [point];

        assert!(select_listening_point(&points, local, Transport::Udp, |p| &**p).is_some());
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = ListeningPoints::default();
        let first = lp("10.0.0.2", 8000, Transport::Tcp);
        let second = lp("10.0.0.3", 8000, Transport::Tcp);

        registry.insert(first.clone());
        registry.insert(second.clone());

        let local: SocketAddr = "10.0.0.1:8000".parse().unwrap();
        assert!(Arc::ptr_eq(&registry.find(local, Transport::Tcp).unwrap(), &first));

        assert!(registry.remove(&first).is_some());
        assert!(registry.remove(&first).is_none());
        assert!(Arc::ptr_eq(&registry.find(local, Transport::Tcp).unwrap(), &second));
    }
}
