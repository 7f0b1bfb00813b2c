//! Deployment steps: a mock oracle on development networks, then the ledger
//! wired to whichever feed the network configuration selects.

use tracing::info;

use crate::{
    chain::{Chain, ChainError, Receipt},
    config::{ConfigError, FeedSelection, NetworkConfig},
    error::FundMeError,
    identity::{Address, Wallet},
    tx::{Call, TxBuilder},
};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("deployment reverted: {0}")]
    Reverted(FundMeError),
    #[error("no mock aggregator deployed on development network {0:?}")]
    MissingMock(String),
    #[error("deployment produced no contract")]
    NoContract,
}

#[derive(Clone, Debug)]
pub struct Deployment {
    pub network: String,
    pub fund_me: Address,
    pub price_feed: Address,
    pub mock: bool,
    pub receipts: Vec<Receipt>,
}

/// Deploy the mock aggregator, but only on development networks.
pub fn deploy_mocks(
    chain: &mut Chain,
    deployer: &Wallet,
    network: &str,
    config: &NetworkConfig,
    timestamp: u64,
) -> Result<Option<Receipt>, DeployError> {
    let FeedSelection::Mock {
        decimals,
        initial_answer,
    } = config.resolve_feed(network, chain.chain_id())?
    else {
        return Ok(None);
    };
    info!(network, "local network detected, deploying mocks");
    let receipt = send(
        chain,
        deployer,
        Call::DeployMockAggregator {
            decimals,
            initial_answer,
        },
        timestamp,
    )?;
    Ok(Some(receipt))
}

/// Deploy the ledger against `mock` on development networks, or against the
/// configured live feed address otherwise.
pub fn deploy_fund_me(
    chain: &mut Chain,
    deployer: &Wallet,
    network: &str,
    config: &NetworkConfig,
    mock: Option<Address>,
    timestamp: u64,
) -> Result<Deployment, DeployError> {
    let (price_feed, is_mock) = match config.resolve_feed(network, chain.chain_id())? {
        FeedSelection::Mock { .. } => (
            mock.ok_or_else(|| DeployError::MissingMock(network.to_string()))?,
            true,
        ),
        FeedSelection::Live(address) => (address, false),
    };
    let receipt = send(chain, deployer, Call::DeployFundMe { price_feed }, timestamp)?;
    let fund_me = receipt
        .contract_address
        .ok_or(DeployError::NoContract)?;
    info!(network, %fund_me, %price_feed, mock = is_mock, "ledger deployed");
    Ok(Deployment {
        network: network.to_string(),
        fund_me,
        price_feed,
        mock: is_mock,
        receipts: vec![receipt],
    })
}

/// Both steps in order.
pub fn deploy_all(
    chain: &mut Chain,
    deployer: &Wallet,
    network: &str,
    config: &NetworkConfig,
    timestamp: u64,
) -> Result<Deployment, DeployError> {
    let mock_receipt = deploy_mocks(chain, deployer, network, config, timestamp)?;
    let mock = mock_receipt.as_ref().and_then(|r| r.contract_address);
    let mut deployment = deploy_fund_me(chain, deployer, network, config, mock, timestamp)?;
    if let Some(receipt) = mock_receipt {
        deployment.receipts.insert(0, receipt);
    }
    Ok(deployment)
}

fn send(
    chain: &mut Chain,
    deployer: &Wallet,
    call: Call,
    timestamp: u64,
) -> Result<Receipt, DeployError> {
    let nonce = chain.nonce(&deployer.address());
    let signed = TxBuilder::new(deployer, chain.chain_id()).call(nonce, None, 0, call);
    let receipt = chain.execute(&signed, timestamp)?;
    match receipt.error() {
        Some(err) => Err(DeployError::Reverted(err.clone())),
        None => Ok(receipt),
    }
}
