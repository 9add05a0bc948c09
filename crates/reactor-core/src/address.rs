use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// An immutable IPv4 socket address with a cached textual form, so that
/// logging a busy acceptor or connection table never re-runs the
/// dotted-quad formatter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    ip: Ipv4Addr,
    port: u16,
    text: String,
}

impl Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        let text = format!("{ip}:{port}");
        Self { ip, port, text }
    }

    /// `0.0.0.0:port`, the usual "listen on every interface" address.
    pub fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// `127.0.0.1:port`.
    pub fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::new(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => {
                // This core is IPv4-only (spec §6); a v6 peer can only reach
                // us through a dual-stack NAT/proxy, so we fold it down to
                // the unspecified v4 address rather than panicking.
                let _ = v6;
                Address::any(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ip_and_port() {
        let addr = Address::new(Ipv4Addr::new(127, 0, 0, 1), 9981);
        assert_eq!(addr.as_str(), "127.0.0.1:9981");
        assert_eq!(addr.to_string(), "127.0.0.1:9981");
    }

    #[test]
    fn any_binds_unspecified() {
        let addr = Address::any(0);
        assert_eq!(addr.ip(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn round_trips_through_socket_addr() {
        let addr = Address::loopback(4000);
        let sock = addr.to_socket_addr();
        let back: Address = sock.into();
        assert_eq!(addr, back);
    }
}
