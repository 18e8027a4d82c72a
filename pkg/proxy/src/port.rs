use anyhow::{Context, Result};
use pkg_types::meta::{IpFamily, Protocol};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use tracing::{error, info};

/// A port held open on the node so nothing else can take it.
///
/// An empty `ip` means all addresses of `family`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalPort {
    pub description: String,
    pub ip: String,
    pub family: IpFamily,
    pub port: u16,
    pub protocol: Protocol,
}

impl LocalPort {
    pub fn new(
        description: impl Into<String>,
        ip: impl Into<String>,
        family: IpFamily,
        port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            description: description.into(),
            ip: ip.into(),
            family,
            port,
            protocol,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = if self.ip.is_empty() {
            match self.family {
                IpFamily::IPv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpFamily::IPv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            }
        } else {
            self.ip
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid local port address {:?}", self.ip))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl std::fmt::Display for LocalPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = if self.ip.is_empty() { "*" } else { self.ip.as_str() };
        write!(
            f,
            "{:?} ({}:{}/{})",
            self.description,
            ip,
            self.port,
            self.protocol.lowercase()
        )
    }
}

/// A held resource that can be released.
pub trait Closeable: Send + Sync {
    fn close(&mut self) -> Result<()>;
}

/// Opens and holds local ports.
pub trait PortOpener: Send + Sync {
    fn open_local_port(&self, lp: &LocalPort) -> Result<Box<dyn Closeable>>;
}

/// Port reservations keyed by the port they hold.
pub type PortMap = HashMap<LocalPort, Box<dyn Closeable>>;

/// Close every port in `replacement` that is not also held in `original`.
///
/// Used to undo the reservations of a failed sync pass.
pub fn revert_ports(replacement: &mut PortMap, original: &PortMap) {
    for (lp, socket) in replacement.iter_mut() {
        if original.contains_key(lp) {
            continue;
        }
        info!("closing local port {} after failed sync", lp);
        if let Err(e) = socket.close() {
            error!("failed to close local port {}: {}", lp, e);
        }
    }
}

enum HeldSocket {
    Tcp(Option<TcpListener>),
    Udp(Option<UdpSocket>),
}

impl Closeable for HeldSocket {
    fn close(&mut self) -> Result<()> {
        match self {
            HeldSocket::Tcp(l) => drop(l.take()),
            HeldSocket::Udp(s) => drop(s.take()),
        }
        Ok(())
    }
}

/// Holds ports by binding real sockets.
#[derive(Default)]
pub struct ListenPortOpener;

impl PortOpener for ListenPortOpener {
    fn open_local_port(&self, lp: &LocalPort) -> Result<Box<dyn Closeable>> {
        let addr = lp.socket_addr()?;
        let socket = match lp.protocol {
            Protocol::Tcp => HeldSocket::Tcp(Some(
                TcpListener::bind(addr).with_context(|| format!("listen on {}", lp))?,
            )),
            Protocol::Udp => HeldSocket::Udp(Some(
                UdpSocket::bind(addr).with_context(|| format!("bind {}", lp))?,
            )),
            Protocol::Sctp => anyhow::bail!("unsupported protocol for local port {}", lp),
        };
        info!("opened local port {}", lp);
        Ok(Box::new(socket))
    }
}
