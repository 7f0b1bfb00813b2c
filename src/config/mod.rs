use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::identity::Address;

pub const DEV_CHAIN_ID: u64 = 31337;
pub const DECIMALS: u8 = 8;
pub const INITIAL_ANSWER: i128 = 130_000_000_000;

/// ETH/USD aggregator on goerli (chain 5).
pub const GOERLI_ETH_USD: Address = Address([
    0xe9, 0x9c, 0x3f, 0x74, 0xad, 0x6e, 0x06, 0xa8, 0x90, 0xf8, 0x4d, 0xca, 0x1f, 0x5c, 0x9a, 0x11,
    0xba, 0xe5, 0x58, 0xbb,
]);
/// ETH/USD aggregator on polygon (chain 137).
pub const POLYGON_ETH_USD: Address = Address([
    0xf9, 0x68, 0x0d, 0x99, 0xd6, 0xc9, 0x58, 0x9e, 0x2a, 0x93, 0xa7, 0x8a, 0x04, 0xa2, 0x79, 0xe5,
    0x09, 0x20, 0x59, 0x45,
]);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("network {name:?} (chain {chain_id}) has no price feed configured")]
    UnknownNetwork { name: String, chain_id: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkEntry {
    pub name: String,
    pub eth_usd_price_feed: Address,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockSettings {
    pub decimals: u8,
    pub initial_answer: i128,
}

/// Which live feed each public network uses, and which network names are
/// local development chains that get a mock instead.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub networks: BTreeMap<u64, NetworkEntry>,
    pub development_chains: Vec<String>,
    pub mock: MockSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedSelection {
    Mock { decimals: u8, initial_answer: i128 },
    Live(Address),
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            5,
            NetworkEntry {
                name: "goerli".into(),
                eth_usd_price_feed: GOERLI_ETH_USD,
            },
        );
        networks.insert(
            137,
            NetworkEntry {
                name: "polygon".into(),
                eth_usd_price_feed: POLYGON_ETH_USD,
            },
        );
        Self {
            networks,
            development_chains: vec!["hardhat".into(), "localhost".into()],
            mock: MockSettings {
                decimals: DECIMALS,
                initial_answer: INITIAL_ANSWER,
            },
        }
    }
}

impl NetworkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn is_development(&self, network: &str) -> bool {
        self.development_chains.iter().any(|n| n == network)
    }

    /// Chain id for a network name: development chains share the local id.
    pub fn chain_id(&self, network: &str) -> Option<u64> {
        if self.is_development(network) {
            return Some(DEV_CHAIN_ID);
        }
        self.networks
            .iter()
            .find(|(_, entry)| entry.name == network)
            .map(|(id, _)| *id)
    }

    pub fn resolve_feed(&self, network: &str, chain_id: u64) -> Result<FeedSelection, ConfigError> {
        if self.is_development(network) {
            return Ok(FeedSelection::Mock {
                decimals: self.mock.decimals,
                initial_answer: self.mock.initial_answer,
            });
        }
        self.networks
            .get(&chain_id)
            .map(|entry| FeedSelection::Live(entry.eth_usd_price_feed))
            .ok_or_else(|| ConfigError::UnknownNetwork {
                name: network.to_string(),
                chain_id,
            })
    }
}
