//! Windows connection table via the IP Helper API.
//!
//! `GetExtendedTcpTable` / `GetExtendedUdpTable` with the `OWNER_PID` table
//! classes see sockets from every session without admin rights.

use crate::connection::{ConnectionRecord, ConnectionState, Protocol};
use crate::error::SnapshotError;
use chrono::Utc;
use log::debug;
use std::collections::HashMap;
use std::ffi::c_void;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use windows::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, GetExtendedUdpTable, TCP_TABLE_CLASS, UDP_TABLE_CLASS,
};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};
use windows::Win32::System::ProcessStatus::GetModuleFileNameExW;
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};

const TCP_TABLE_OWNER_PID_ALL: TCP_TABLE_CLASS = TCP_TABLE_CLASS(5);
const UDP_TABLE_OWNER_PID: UDP_TABLE_CLASS = UDP_TABLE_CLASS(1);
const ERROR_INSUFFICIENT_BUFFER: u32 = 122;

#[repr(C)]
#[derive(Clone, Copy)]
struct MibTcpRowOwnerPid {
    state: u32,
    local_addr: u32,
    local_port: u32,
    remote_addr: u32,
    remote_port: u32,
    owning_pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MibTcp6RowOwnerPid {
    local_addr: [u8; 16],
    local_scope_id: u32,
    local_port: u32,
    remote_addr: [u8; 16],
    remote_scope_id: u32,
    remote_port: u32,
    state: u32,
    owning_pid: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MibUdpRowOwnerPid {
    local_addr: u32,
    local_port: u32,
    owning_pid: u32,
}

pub struct TcpTableSource;

impl TcpTableSource {
    pub fn new() -> Self {
        TcpTableSource
    }
}

impl Default for TcpTableSource {
    fn default() -> Self {
        Self::new()
    }
}

impl super::SnapshotSource for TcpTableSource {
    fn name(&self) -> &'static str {
        "iphelper"
    }

    fn snapshot(&self) -> Result<Vec<ConnectionRecord>, SnapshotError> {
        let observed_at = Utc::now();
        let mut names: HashMap<u32, String> = HashMap::new();
        let mut records = Vec::new();

        let tcp4 = fetch_table("GetExtendedTcpTable(AF_INET)", |buf, size| unsafe {
            GetExtendedTcpTable(buf, size, false, AF_INET.0 as u32, TCP_TABLE_OWNER_PID_ALL, 0)
        })?;
        for row in rows::<MibTcpRowOwnerPid>(&tcp4) {
            let remote_addr = IpAddr::V4(Ipv4Addr::from(u32::from_be(row.remote_addr)));
            records.push(ConnectionRecord {
                pid: row.owning_pid,
                process_name: process_name(&mut names, row.owning_pid),
                local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.local_addr))),
                local_port: net_port(row.local_port),
                remote_addr,
                remote_port: net_port(row.remote_port),
                state: tcp_state(row.state),
                protocol: Protocol::TCP,
                observed_at,
            });
        }

        let tcp6 = fetch_table("GetExtendedTcpTable(AF_INET6)", |buf, size| unsafe {
            GetExtendedTcpTable(buf, size, false, AF_INET6.0 as u32, TCP_TABLE_OWNER_PID_ALL, 0)
        })?;
        for row in rows::<MibTcp6RowOwnerPid>(&tcp6) {
            records.push(ConnectionRecord {
                pid: row.owning_pid,
                process_name: process_name(&mut names, row.owning_pid),
                local_addr: IpAddr::V6(Ipv6Addr::from(row.local_addr)),
                local_port: net_port(row.local_port),
                remote_addr: IpAddr::V6(Ipv6Addr::from(row.remote_addr)),
                remote_port: net_port(row.remote_port),
                state: tcp_state(row.state),
                protocol: Protocol::TCP,
                observed_at,
            });
        }

        let udp4 = fetch_table("GetExtendedUdpTable(AF_INET)", |buf, size| unsafe {
            GetExtendedUdpTable(buf, size, false, AF_INET.0 as u32, UDP_TABLE_OWNER_PID, 0)
        })?;
        for row in rows::<MibUdpRowOwnerPid>(&udp4) {
            records.push(ConnectionRecord {
                pid: row.owning_pid,
                process_name: process_name(&mut names, row.owning_pid),
                local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(row.local_addr))),
                local_port: net_port(row.local_port),
                remote_addr: crate::connection::UNSPECIFIED_V4,
                remote_port: 0,
                state: ConnectionState::Listen,
                protocol: Protocol::UDP,
                observed_at,
            });
        }

        debug!("Enumerated {} sockets", records.len());
        Ok(records)
    }
}

/// Calls a size-probing table API until the buffer is big enough. The table
/// can grow between calls, so a few retries are allowed.
fn fetch_table(
    call: &'static str,
    fetch: impl Fn(Option<*mut c_void>, &mut u32) -> u32,
) -> Result<Vec<u32>, SnapshotError> {
    let mut size: u32 = 0;
    for _ in 0..4 {
        let mut buf = vec![0u32; (size as usize + 3) / 4];
        let ptr = if buf.is_empty() {
            None
        } else {
            Some(buf.as_mut_ptr() as *mut c_void)
        };
        match fetch(ptr, &mut size) {
            0 => return Ok(buf),
            ERROR_INSUFFICIENT_BUFFER => continue,
            code => return Err(SnapshotError::Os { call, code }),
        }
    }
    Err(SnapshotError::Os {
        call,
        code: ERROR_INSUFFICIENT_BUFFER,
    })
}

/// Rows of a `MIB_*TABLE_OWNER_PID`: a `dwNumEntries` word followed by rows.
fn rows<T: Copy>(buf: &[u32]) -> Vec<T> {
    let Some(&count) = buf.first() else {
        return Vec::new();
    };
    let available = (buf.len() - 1) * 4 / std::mem::size_of::<T>();
    let count = (count as usize).min(available);
    let base = buf[1..].as_ptr() as *const T;
    (0..count)
        .map(|i| unsafe { std::ptr::read_unaligned(base.add(i)) })
        .collect()
}

/// Ports sit in the low 16 bits in network byte order.
fn net_port(raw: u32) -> u16 {
    u16::from_be(raw as u16)
}

/// MIB_TCP_STATE values
fn tcp_state(raw: u32) -> ConnectionState {
    match raw {
        1 | 12 => ConnectionState::Closed,
        2 => ConnectionState::Listen,
        3 => ConnectionState::SynSent,
        4 => ConnectionState::SynRecv,
        5 => ConnectionState::Established,
        // FIN_WAIT1, FIN_WAIT2, CLOSING, TIME_WAIT
        6 | 7 | 9 | 11 => ConnectionState::FinWait,
        // CLOSE_WAIT, LAST_ACK
        8 | 10 => ConnectionState::CloseWait,
        _ => ConnectionState::Unknown,
    }
}

fn process_name(cache: &mut HashMap<u32, String>, pid: u32) -> String {
    cache
        .entry(pid)
        .or_insert_with(|| query_process_name(pid).unwrap_or_default())
        .clone()
}

fn query_process_name(pid: u32) -> Option<String> {
    // System idle and System cannot be opened
    if pid == 0 || pid == 4 {
        return None;
    }

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid).ok()?;
        if handle == INVALID_HANDLE_VALUE || handle.0 == 0 {
            return None;
        }

        let mut path_buf = [0u16; 260];
        let len = GetModuleFileNameExW(handle, None, &mut path_buf);
        let _ = CloseHandle(handle);

        if len == 0 {
            return None;
        }
        let path = String::from_utf16_lossy(&path_buf[..len as usize]);
        std::path::Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }
}
