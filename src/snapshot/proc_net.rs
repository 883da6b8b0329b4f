//! Linux connection table from `/proc/net/{tcp,tcp6,udp,udp6}`.
//!
//! Socket ownership comes from walking `/proc/<pid>/fd` and matching
//! `socket:[inode]` links against the inode column of the tables.

use crate::connection::{ConnectionRecord, ConnectionState, Protocol};
use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

struct Table {
    file: &'static str,
    protocol: Protocol,
    /// Missing when the kernel has IPv6 disabled
    optional: bool,
}

const TABLES: [Table; 4] = [
    Table { file: "tcp", protocol: Protocol::TCP, optional: false },
    Table { file: "tcp6", protocol: Protocol::TCP, optional: true },
    Table { file: "udp", protocol: Protocol::UDP, optional: false },
    Table { file: "udp6", protocol: Protocol::UDP, optional: true },
];

/// Owner of a socket inode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOwner {
    pub pid: u32,
    pub name: String,
}

pub struct ProcNetSource {
    root: PathBuf,
}

impl ProcNetSource {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reads from an alternate procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        ProcNetSource { root: root.into() }
    }

    /// Maps socket inodes to their owning process. Processes we may not
    /// inspect are skipped; their sockets end up ownerless.
    fn socket_owners(&self) -> HashMap<u64, SocketOwner> {
        let mut owners = HashMap::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot list {}: {}", self.root.display(), e);
                return owners;
            }
        };

        for entry in entries.flatten() {
            let pid = match entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            let fds = match fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(e) => {
                    trace!("Skipping fds of pid {}: {}", pid, e);
                    continue;
                }
            };

            let mut comm = None;
            for fd in fds.flatten() {
                let inode = match fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target))
                {
                    Some(inode) => inode,
                    None => continue,
                };
                let name = comm
                    .get_or_insert_with(|| read_comm(&entry.path()))
                    .clone();
                owners.entry(inode).or_insert(SocketOwner { pid, name });
            }
        }
        owners
    }
}

impl Default for ProcNetSource {
    fn default() -> Self {
        Self::new()
    }
}

impl super::SnapshotSource for ProcNetSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>, SnapshotError> {
        let observed_at = Utc::now();
        let owners = self.socket_owners();
        let mut records = Vec::new();

        for table in &TABLES {
            let path = self.root.join("net").join(table.file);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound && table.optional => {
                    trace!("{} not present, skipping", path.display());
                    continue;
                }
                Err(source) => return Err(SnapshotError::Io { path, source }),
            };
            records.extend(parse_table(
                &content,
                table.file,
                table.protocol,
                &owners,
                observed_at,
            )?);
        }

        debug!(
            "Enumerated {} sockets ({} with known owner)",
            records.len(),
            records.iter().filter(|r| r.pid != 0).count()
        );
        Ok(records)
    }
}

/// Parses one `/proc/net` table. The first line is the column header.
pub fn parse_table(
    content: &str,
    table: &'static str,
    protocol: Protocol,
    owners: &HashMap<u64, SocketOwner>,
    observed_at: DateTime<Utc>,
) -> Result<Vec<ConnectionRecord>, SnapshotError> {
    let mut records = Vec::new();

    for (index, line) in content.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let parse_err = |reason: String| SnapshotError::Parse {
            table,
            line: index + 1,
            reason,
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return Err(parse_err(format!("expected at least 10 columns, got {}", fields.len())));
        }

        let (local_addr, local_port) = parse_endpoint(fields[1]).map_err(&parse_err)?;
        let (remote_addr, remote_port) = parse_endpoint(fields[2]).map_err(&parse_err)?;
        let code = u8::from_str_radix(fields[3], 16)
            .map_err(|e| parse_err(format!("state {:?}: {}", fields[3], e)))?;
        let inode = fields[9]
            .parse::<u64>()
            .map_err(|e| parse_err(format!("inode {:?}: {}", fields[9], e)))?;

        let state = match protocol {
            Protocol::TCP => tcp_state(code),
            Protocol::UDP => udp_state(remote_addr, remote_port),
        };
        let owner = if inode == 0 { None } else { owners.get(&inode) };

        records.push(ConnectionRecord {
            pid: owner.map(|o| o.pid).unwrap_or(0),
            process_name: owner.map(|o| o.name.clone()).unwrap_or_default(),
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state,
            protocol,
            observed_at,
        });
    }

    Ok(records)
}

/// Decodes `HEXADDR:HEXPORT`. Addresses are printed as native-endian 32-bit
/// words, ports in host order.
pub fn parse_endpoint(raw: &str) -> Result<(IpAddr, u16), String> {
    let (addr_hex, port_hex) = raw
        .split_once(':')
        .ok_or_else(|| format!("endpoint {:?} has no port", raw))?;
    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|e| format!("port {:?}: {}", port_hex, e))?;

    if !addr_hex.is_ascii() {
        return Err(format!("address {:?} is not hex", addr_hex));
    }

    let addr = match addr_hex.len() {
        8 => {
            let word = hex_word(addr_hex)?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = hex_word(&addr_hex[i * 8..i * 8 + 8])?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        n => return Err(format!("address {:?} has unexpected length {}", addr_hex, n)),
    };

    Ok((addr, port))
}

fn hex_word(hex: &str) -> Result<u32, String> {
    u32::from_str_radix(hex, 16).map_err(|e| format!("address word {:?}: {}", hex, e))
}

/// Kernel TCP state codes (include/net/tcp_states.h)
pub fn tcp_state(code: u8) -> ConnectionState {
    match code {
        0x01 => ConnectionState::Established,
        0x02 => ConnectionState::SynSent,
        0x03 => ConnectionState::SynRecv,
        // FIN_WAIT1, FIN_WAIT2, TIME_WAIT, CLOSING
        0x04 | 0x05 | 0x06 | 0x0B => ConnectionState::FinWait,
        0x07 => ConnectionState::Closed,
        // CLOSE_WAIT, LAST_ACK
        0x08 | 0x09 => ConnectionState::CloseWait,
        0x0A => ConnectionState::Listen,
        _ => ConnectionState::Unknown,
    }
}

/// UDP has no handshake; a socket with a peer is connected, one without is
/// bound and waiting.
fn udp_state(remote_addr: IpAddr, remote_port: u16) -> ConnectionState {
    if remote_port == 0 && remote_addr.is_unspecified() {
        ConnectionState::Listen
    } else {
        ConnectionState::Established
    }
}

/// `socket:[12345]` -> 12345
fn socket_inode(link_target: &Path) -> Option<u64> {
    link_target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn read_comm(pid_dir: &Path) -> String {
    fs::read_to_string(pid_dir.join("comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}
