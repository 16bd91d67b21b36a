//! Bucket configuration model.
//!
//! Parses the streaming-config JSON documents pushed by the cluster manager
//! and resolves them into a [`Topology`]: one kv endpoint per node with the
//! selected network view and SSL variant applied, plus the partition → node
//! assignment. Only strictly greater revisions are ever applied; the gate
//! lives in the config provider.

use crate::config::NetworkResolution;
use crate::error::ConfigError;
use crate::host::HostAndPort;
use crate::partitions::MAX_PARTITIONS;
use serde::Deserialize;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// JSON model
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BucketConfig {
    pub rev: i64,
    #[serde(rename = "nodesExt", default)]
    pub nodes_ext: Vec<NodeConfig>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: VbucketServerMap,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub hostname: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, u16>,
    #[serde(rename = "alternateAddresses", default)]
    pub alternate_addresses: HashMap<String, AlternateAddress>,
}

#[derive(Debug, Deserialize)]
pub struct AlternateAddress {
    pub hostname: String,
    #[serde(default)]
    pub ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize, Default)]
struct VbucketServerMap {
    #[serde(rename = "vBucketMap", default)]
    vbucket_map: Vec<Vec<i32>>,
}

impl BucketConfig {
    /// Pure `raw → config` parse.
    pub fn parse(raw: &str) -> Result<BucketConfig, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Decide which address view to use, per the `networkResolution` setting.
    ///
    /// `None` means the primary view; `Some(name)` an alternate map. For
    /// `auto`: a node whose primary hostname matches a seed host pins
    /// `default`; otherwise the first alternate map whose hostname matches a
    /// seed host wins; no match at all falls back to `default`.
    pub fn resolve_network(
        &self,
        setting: &NetworkResolution,
        seeds: &[HostAndPort],
    ) -> Option<String> {
        match setting {
            NetworkResolution::Default => None,
            NetworkResolution::Named(name) => Some(name.clone()),
            NetworkResolution::Auto => {
                for node in &self.nodes_ext {
                    if let Some(hostname) = &node.hostname {
                        if seeds.iter().any(|seed| seed.host() == hostname) {
                            return None;
                        }
                    }
                    for (name, alternate) in &node.alternate_addresses {
                        if seeds.iter().any(|seed| seed.host() == alternate.hostname) {
                            return Some(name.clone());
                        }
                    }
                }
                None
            }
        }
    }

    /// Resolve the config into a [`Topology`] under the given network view.
    pub fn topology(&self, network: Option<&str>, ssl: bool) -> Result<Topology, ConfigError> {
        let num_partitions = self.vbucket_server_map.vbucket_map.len();
        if num_partitions > MAX_PARTITIONS {
            return Err(ConfigError::TooManyPartitions(num_partitions));
        }
        let service = if ssl { "kvSSL" } else { "kv" };
        let nodes = self
            .nodes_ext
            .iter()
            .map(|node| node.address(network, service))
            .collect();
        let partition_map = self
            .vbucket_server_map
            .vbucket_map
            .iter()
            .map(|chain| chain.first().copied().unwrap_or(-1))
            .collect();
        Ok(Topology {
            rev: self.rev,
            nodes,
            partition_map,
        })
    }
}

impl NodeConfig {
    /// The `(hostname, port)` of one service on this node under a network
    /// view. Alternate views fall back to the primary port map for ports the
    /// alternate does not remap.
    fn address(&self, network: Option<&str>, service: &str) -> Option<HostAndPort> {
        match network {
            None => {
                let hostname = self.hostname.as_deref()?;
                let port = self.services.get(service)?;
                Some(HostAndPort::new(hostname, *port))
            }
            Some(name) => {
                let alternate = self.alternate_addresses.get(name)?;
                let port = alternate
                    .ports
                    .get(service)
                    .or_else(|| self.services.get(service))?;
                Some(HostAndPort::new(&alternate.hostname, *port))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// The resolved view the conductor works from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    rev: i64,
    /// kv endpoint per node; `None` for nodes without the kv service in the
    /// selected view.
    nodes: Vec<Option<HostAndPort>>,
    /// Primary node index per partition; `-1` when unassigned.
    partition_map: Vec<i32>,
}

impl Topology {
    pub fn rev(&self) -> i64 {
        self.rev
    }

    pub fn num_partitions(&self) -> usize {
        self.partition_map.len()
    }

    pub fn partition_owner(&self, vbucket: u16) -> Option<&HostAndPort> {
        let index = *self.partition_map.get(usize::from(vbucket))?;
        let index = usize::try_from(index).ok()?;
        self.nodes.get(index)?.as_ref()
    }

    /// Distinct kv endpoints owning at least one partition, in node order.
    pub fn owning_nodes(&self) -> Vec<HostAndPort> {
        let mut owners = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            let Some(host) = node else { continue };
            let owns = self
                .partition_map
                .iter()
                .any(|&primary| primary == i32::try_from(index).unwrap_or(-1));
            if owns && !owners.contains(host) {
                owners.push(host.clone());
            }
        }
        owners
    }
}
