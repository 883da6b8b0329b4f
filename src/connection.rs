use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Transport protocol of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    TCP,
    UDP,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TCP => write!(f, "tcp"),
            Protocol::UDP => write!(f, "udp"),
        }
    }
}

/// Socket state as reported by the OS, folded into the states we report on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Listen,
    Established,
    SynSent,
    SynRecv,
    FinWait,
    CloseWait,
    Closed,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Listen => "LISTEN",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::SynSent => "SYN_SENT",
            ConnectionState::SynRecv => "SYN_RECV",
            ConnectionState::FinWait => "FIN_WAIT",
            ConnectionState::CloseWait => "CLOSE_WAIT",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One row of the OS connection table, captured at `observed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Owning process, 0 when it could not be resolved
    pub pid: u32,
    /// Empty when the owner is unknown or access was denied
    pub process_name: String,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub state: ConnectionState,
    pub protocol: Protocol,
    pub observed_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }

    /// A socket with no peer: TCP listeners and unconnected UDP sockets.
    pub fn is_listening(&self) -> bool {
        self.state == ConnectionState::Listen
            || (self.remote_port == 0 && self.remote_addr.is_unspecified())
    }

    pub fn process_label(&self) -> &str {
        if self.process_name.is_empty() {
            "unknown"
        } else {
            &self.process_name
        }
    }
}

/// Identity of a connection across polls.
///
/// Built only from the socket tuple. PID, process name, state and capture
/// time are payload: a process restarting on the same tuple keeps its
/// identity, and a state change is not a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub protocol: Protocol,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

impl Fingerprint {
    pub fn of(record: &ConnectionRecord) -> Self {
        Fingerprint::new(
            record.protocol,
            record.local_addr,
            record.local_port,
            record.remote_addr,
            record.remote_port,
        )
    }

    /// Builds a fingerprint, canonicalizing both addresses.
    pub fn new(
        protocol: Protocol,
        local_addr: IpAddr,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
    ) -> Self {
        Fingerprint {
            protocol,
            local_addr: canonical_addr(local_addr),
            local_port,
            remote_addr: canonical_addr(remote_addr),
            remote_port,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol,
            SocketLabel(self.local_addr, self.local_port),
            SocketLabel(self.remote_addr, self.remote_port)
        )
    }
}

/// `addr:port`, bracketing IPv6 addresses.
pub struct SocketLabel(pub IpAddr, pub u16);

impl fmt::Display for SocketLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.1),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.1),
        }
    }
}

/// Collapses IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to plain IPv4 so dual-stack
/// sockets report one identity regardless of which table they came from.
pub fn canonical_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => addr,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
    }
}

#[cfg(any(windows, test))]
pub const UNSPECIFIED_V4: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);
