use crate::config::FilterConfig;
use crate::connection::{canonical_addr, ConnectionRecord};
use crate::error::ConfigError;
use ipnetwork::IpNetwork;
use log::{debug, info};

/// Decides which enumerated sockets are tracked at all.
///
/// Dropped sockets never reach the baseline, so they can neither alert nor
/// be evicted.
pub struct ConnectionFilter {
    include_listening: bool,
    ignore_loopback: bool,
    ignore_networks: Vec<IpNetwork>,
}

impl ConnectionFilter {
    pub fn new(config: &FilterConfig) -> Result<Self, ConfigError> {
        let mut ignore_networks = Vec::new();
        for range_str in &config.ignore_networks {
            match range_str.parse::<IpNetwork>() {
                Ok(network) => {
                    debug!("Ignoring remote range {}", network);
                    ignore_networks.push(network);
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        field: "filter.ignore_networks",
                        reason: format!("{:?}: {}", range_str, e),
                    })
                }
            }
        }

        info!(
            "Connection filter: listening={}, loopback={}, {} ignored ranges",
            if config.include_listening { "tracked" } else { "skipped" },
            if config.ignore_loopback { "skipped" } else { "tracked" },
            ignore_networks.len()
        );

        Ok(ConnectionFilter {
            include_listening: config.include_listening,
            ignore_loopback: config.ignore_loopback,
            ignore_networks,
        })
    }

    /// Tracks everything except listening sockets.
    #[cfg(test)]
    pub fn permissive() -> Self {
        ConnectionFilter {
            include_listening: false,
            ignore_loopback: false,
            ignore_networks: Vec::new(),
        }
    }

    pub fn accepts(&self, record: &ConnectionRecord) -> bool {
        if record.is_listening() {
            return self.include_listening;
        }

        let remote = canonical_addr(record.remote_addr);
        if self.ignore_loopback && remote.is_loopback() {
            return false;
        }
        if let Some(network) = self.ignore_networks.iter().find(|n| n.contains(remote)) {
            log::trace!("{} ignored by range {}", record.fingerprint(), network);
            return false;
        }
        true
    }

    pub fn apply(&self, records: Vec<ConnectionRecord>) -> Vec<ConnectionRecord> {
        let before = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| self.accepts(r)).collect();
        if kept.len() != before {
            debug!("Filter dropped {} of {} sockets", before - kept.len(), before);
        }
        kept
    }
}
