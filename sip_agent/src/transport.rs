use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

/// Ports tried in order when binding the SIP socket.
pub const DEFAULT_CANDIDATE_PORTS: [u16; 5] = [5060, 5061, 5062, 5063, 5064];

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no free UDP port among {0:?}")]
    NoFreePort(Vec<u16>),
    #[error("failed to resolve {0}")]
    Resolution(String),
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub bind_ip: IpAddr,
    pub candidate_ports: Vec<u16>,
    /// Address used for the connectionless route lookup that reveals the
    /// outbound interface. Nothing is sent to it.
    pub probe_addr: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            candidate_ports: DEFAULT_CANDIDATE_PORTS.to_vec(),
            probe_addr: SocketAddr::from(([8, 8, 8, 8], 80)),
        }
    }
}

/// The single UDP endpoint every REGISTER goes out of.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    local_ip: IpAddr,
    bound_port: u16,
    rx_buf: Box<[u8; MAX_DATAGRAM]>,
}

impl UdpTransport {
    pub fn open(config: &TransportConfig) -> Result<Self> {
        let local_ip = if config.bind_ip.is_unspecified() {
            discover_local_ip(config.probe_addr)
        } else {
            config.bind_ip
        };

        let (socket, bound_port) = bind_first_free(config.bind_ip, &config.candidate_ports)?;
        info!("UDP transport on {}:{} (local ip {})", config.bind_ip, bound_port, local_ip);

        Ok(Self {
            socket: Some(socket),
            local_ip,
            bound_port,
            rx_buf: Box::new([0u8; MAX_DATAGRAM]),
        })
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Resolve `host` (IP literal, hosts file or DNS), preferring the
    /// address family of the bound socket.
    pub fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let want_v4 = self
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map_or(true, |a| a.is_ipv4());

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                warn!("failed to resolve {host}: {e}");
                TransportError::Resolution(host.to_string())
            })?
            .collect();

        addrs
            .iter()
            .find(|a| a.is_ipv4() == want_v4)
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TransportError::Resolution(host.to_string()))
    }

    /// Resolve and send one datagram. Failures are logged here and handed
    /// back so the caller can abort its attempt.
    pub fn send(&self, payload: &[u8], host: &str, port: u16) -> Result<usize> {
        let addr = self.resolve(host, port)?;
        self.send_to(payload, addr)
    }

    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        match socket.send_to(payload, addr) {
            Ok(sent) => {
                debug!("sent {sent} bytes to {addr}");
                Ok(sent)
            }
            Err(e) => {
                warn!("failed to send to {addr}: {e}");
                Err(e.into())
            }
        }
    }

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;
        // A zero read timeout is rejected by the OS.
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match socket.recv_from(&mut self.rx_buf[..]) {
            Ok((len, from)) => {
                if len == MAX_DATAGRAM {
                    warn!("datagram from {from} filled the receive buffer and may be truncated");
                }
                Ok(Some((self.rx_buf[..len].to_vec(), from)))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            info!("UDP transport on port {} closed", self.bound_port);
        }
    }
}

fn bind_first_free(ip: IpAddr, ports: &[u16]) -> Result<(UdpSocket, u16)> {
    for &port in ports {
        match UdpSocket::bind((ip, port)) {
            Ok(socket) => {
                let bound = socket.local_addr()?.port();
                return Ok((socket, bound));
            }
            Err(e) => debug!("port {port} unavailable ({e}), trying next"),
        }
    }
    warn!("UDP bind failed on all candidate ports {ports:?}");
    Err(TransportError::NoFreePort(ports.to_vec()))
}

/// Outbound interface address: route lookup via a connected UDP socket,
/// then the local hostname, then loopback.
pub fn discover_local_ip(probe: SocketAddr) -> IpAddr {
    let routed = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| s.connect(probe).map(|_| s))
        .and_then(|s| s.local_addr())
        .map(|a| a.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified());
    if let Some(ip) = routed {
        debug!("local ip via route lookup: {ip}");
        return ip;
    }

    let by_name = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .and_then(|name| (name.as_str(), 0).to_socket_addrs().ok())
        .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        .map(|a| a.ip());
    if let Some(ip) = by_name {
        debug!("local ip via hostname: {ip}");
        return ip;
    }

    warn!("could not determine local ip; using loopback");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
