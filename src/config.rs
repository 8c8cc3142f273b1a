// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use crate::error::{Error, Result};
use crate::timeouts::Timeouts;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Default fanout of a freshly started tree.
pub const DEFAULT_FANOUT: u16 = 2;

/// Default horizontal value assigned to the root position by the treemapper.
/// Every other horizontal value is derived from it deterministically.
pub const DEFAULT_TREEMAPPER_ROOT: u16 = 100;

/// Default bound on the per-key ring of recent update timestamps kept by a
/// DSN for each observed peer.
pub const DEFAULT_TIMESTAMP_STORAGE_LIMIT: usize = 5;

/// Default multicast group used for bootstrap discovery.
pub const DEFAULT_DISCOVERY_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 43, 98), 4546);

/// How a starting node gets into the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinMode {
    /// Become the root of a fresh tree.
    Root,
    /// Join via a known endpoint of any connected peer.
    KnownEndpoint(SocketAddr),
    /// Join via UDP multicast discovery.
    Discovery,
}

/// Implementation selectors for the protocol behaviors. A single behavior
/// family exists today; the slots are kept for extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlgorithmSet {
    pub bootstrap: BootstrapAlgorithm,
    pub join: JoinAlgorithm,
    pub leave: LeaveAlgorithm,
    pub search_exact: SearchExactAlgorithm,
    pub response: ResponseAlgorithm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum BootstrapAlgorithm {
    #[default]
    Multicast,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum JoinAlgorithm {
    #[default]
    MinimumDepth,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum LeaveAlgorithm {
    #[default]
    Replacement,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum SearchExactAlgorithm {
    #[default]
    Greedy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseAlgorithm {
    #[default]
    General,
}

/// Node configuration.
///
/// `fanout` and `treemapper_root` only matter on the root node; every joiner
/// adopts the values carried in its `JoinAccept`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local address to bind the transport to.
    pub local_addr: SocketAddr,
    /// Maximum number of children per tree node. Must be at least 2.
    pub fanout: u16,
    /// Root value of the treemapper embedding.
    pub treemapper_root: u16,
    /// How this node enters the tree.
    pub join: JoinMode,
    /// Timeout lengths.
    pub timeouts: Timeouts,
    /// Behavior family selectors.
    pub algorithms: AlgorithmSet,
    /// Bound on the per-key update-timestamp ring of distributed data.
    pub timestamp_storage_limit: usize,
    /// Multicast group for bootstrap discovery.
    pub discovery_group: SocketAddrV4,
}

impl Config {
    /// Configuration for the root of a fresh tree.
    pub fn root(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            join: JoinMode::Root,
            ..Self::joining(local_addr, local_addr)
        }
    }

    /// Configuration for a node joining via a known contact endpoint.
    pub fn joining(local_addr: SocketAddr, contact: SocketAddr) -> Self {
        Self {
            local_addr,
            fanout: DEFAULT_FANOUT,
            treemapper_root: DEFAULT_TREEMAPPER_ROOT,
            join: JoinMode::KnownEndpoint(contact),
            timeouts: Timeouts::default(),
            algorithms: AlgorithmSet::default(),
            timestamp_storage_limit: DEFAULT_TIMESTAMP_STORAGE_LIMIT,
            discovery_group: DEFAULT_DISCOVERY_GROUP,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.fanout < 2 {
            return Err(Error::InvalidFanout(self.fanout));
        }
        if self.treemapper_root == 0 {
            return Err(Error::Configuration(
                "treemapper root value must be positive".to_string(),
            ));
        }
        if self.timestamp_storage_limit == 0 {
            return Err(Error::Configuration(
                "timestamp storage limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
