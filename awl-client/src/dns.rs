//! Name table for the local `awl` zone
//!
//! Built from the known peers on every `KnownPeerChanged`; the resolver
//! daemon queries it for forward and PTR lookups.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConfigHandle;
use crate::event_bus::Event;

/// Local zone, without the trailing dot
pub const LOCAL_DOMAIN: &str = "awl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Ipv4Addr),
    /// In the local zone but unknown
    NotFound,
    /// Outside the local zone; belongs to the upstream resolver
    NotLocal,
}

#[derive(Default)]
struct Tables {
    forward: BTreeMap<String, Ipv4Addr>,
    reverse: BTreeMap<Ipv4Addr, String>,
}

#[derive(Clone, Default)]
pub struct DnsMapping {
    tables: Arc<RwLock<Tables>>,
}

impl DnsMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tables with `mapping` (name or PeerID to address)
    pub fn update(&self, mapping: BTreeMap<String, Ipv4Addr>) {
        let forward: BTreeMap<String, Ipv4Addr> = mapping
            .into_iter()
            .map(|(name, ip)| (name.to_ascii_lowercase(), ip))
            .collect();
        let mut reverse = BTreeMap::new();
        // forward is sorted, so the first name seen per ip is the smallest
        for (name, ip) in &forward {
            reverse.entry(*ip).or_insert_with(|| format!("{}.{}.", name, LOCAL_DOMAIN));
        }
        debug!("dns mapping updated with {} names", forward.len());
        *self.tables.write() = Tables { forward, reverse };
    }

    /// Rebuild from the config now and on every known-peer change
    pub fn follow_config(&self, config: &ConfigHandle, cancel: &CancellationToken) -> JoinHandle<()> {
        self.update(config.read(|c| c.dns_names_mapping()));
        let this = self.clone();
        let handle = config.clone();
        config
            .events()
            .subscribe_with_callback(cancel.clone(), move |ev| {
                if ev == Event::KnownPeerChanged {
                    this.update(handle.read(|c| c.dns_names_mapping()));
                }
            })
    }

    /// Resolve `name` (with or without trailing dot)
    pub fn lookup(&self, name: &str) -> Lookup {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let suffix = format!(".{}", LOCAL_DOMAIN);
        let Some(host) = name.strip_suffix(&suffix) else {
            return if name == LOCAL_DOMAIN {
                Lookup::NotFound
            } else {
                Lookup::NotLocal
            };
        };
        match self.tables.read().forward.get(host) {
            Some(ip) => Lookup::Found(*ip),
            None => Lookup::NotFound,
        }
    }

    /// Canonical name for `ip`, the lexicographically smallest one
    pub fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.tables.read().reverse.get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
