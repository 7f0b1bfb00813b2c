use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    error::FundMeError,
    identity::Address,
    ledger::{CallContext, FundMe, Host, LedgerEvent, StorageMeter},
    oracle::{MockV3Aggregator, PriceFeed},
    tx::{Call, SignedTransaction, TxError},
    units::Amount,
};

pub const BASE_TX_GAS: u64 = 21_000;
pub const CREATE_GAS: u64 = 32_000;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("transaction for chain {got}, this chain is {expected}")]
    WrongChain { expected: u64, got: u64 },
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error("nonce mismatch for {account}: expected {expected}, got {got}")]
    NonceMismatch {
        account: Address,
        expected: u64,
        got: u64,
    },
    #[error("account {account} holds {balance}, needs {needed}")]
    InsufficientBalance {
        account: Address,
        balance: Amount,
        needed: Amount,
    },
    #[error("call does not accept value")]
    NonPayable,
    #[error("no matching contract at {0}")]
    UnknownContract(Address),
    #[error("call needs a recipient")]
    MissingRecipient,
    #[error("deployments take no recipient")]
    UnexpectedRecipient,
    #[error("{0} is a contract account")]
    ContractAccount(Address),
    #[error("balance overflow for {0}")]
    BalanceOverflow(Address),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChainMeta {
    pub height: u64,
    pub timestamp: u64,
    pub last_tx: Option<[u8; 32]>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Reverted { error: FundMeError },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    #[serde(with = "crate::tx::serde_hex32")]
    pub tx_hash: [u8; 32],
    pub height: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub status: TxStatus,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    pub events: Vec<LedgerEvent>,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }

    pub fn error(&self) -> Option<&FundMeError> {
        match &self.status {
            TxStatus::Success => None,
            TxStatus::Reverted { error } => Some(error),
        }
    }
}

/// Balances and oracles a ledger call can reach. Snapshotted per call.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct World {
    balances: BTreeMap<Address, Amount>,
    feeds: BTreeMap<Address, MockV3Aggregator>,
    /// Accounts whose incoming transfers fail.
    rejects_value: BTreeSet<Address>,
    #[serde(skip)]
    pending_events: Vec<LedgerEvent>,
}

impl Host for World {
    fn price_feed(&self, address: &Address) -> Option<&dyn PriceFeed> {
        self.feeds.get(address).map(|feed| feed as &dyn PriceFeed)
    }

    fn balance(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), FundMeError> {
        let failed = || FundMeError::TransferFailed { to: *to, amount };
        if self.rejects_value.contains(to) {
            return Err(failed());
        }
        let from_balance = self.balance(from);
        let remaining = from_balance.checked_sub(amount).ok_or_else(failed)?;
        let credited = self
            .balance(to)
            .checked_add(amount)
            .ok_or(FundMeError::ArithmeticOverflow)?;
        self.balances.insert(*from, remaining);
        self.balances.insert(*to, credited);
        Ok(())
    }

    fn emit(&mut self, event: LedgerEvent) {
        self.pending_events.push(event);
    }
}

/// Single-process execution environment. Every transaction runs to
/// completion or leaves balances, oracles and ledgers exactly as before.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chain {
    chain_id: u64,
    meta: ChainMeta,
    world: World,
    nonces: BTreeMap<Address, u64>,
    ledgers: BTreeMap<Address, FundMe>,
    events: Vec<LedgerEvent>,
    receipts: Vec<Receipt>,
}

impl Chain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            meta: ChainMeta::default(),
            world: World::default(),
            nonces: BTreeMap::new(),
            ledgers: BTreeMap::new(),
            events: Vec::new(),
            receipts: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ChainError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn meta(&self) -> &ChainMeta {
        &self.meta
    }

    /// The host view ledgers run against, for read-only queries.
    pub fn host(&self) -> &World {
        &self.world
    }

    pub fn balance(&self, account: &Address) -> Amount {
        self.world.balance(account)
    }

    pub fn nonce(&self, account: &Address) -> u64 {
        self.nonces.get(account).copied().unwrap_or(0)
    }

    pub fn ledger(&self, address: &Address) -> Option<&FundMe> {
        self.ledgers.get(address)
    }

    /// Most recently deployed ledger, if any.
    pub fn latest_ledger(&self) -> Option<Address> {
        self.receipts
            .iter()
            .rev()
            .filter_map(|r| r.contract_address)
            .find(|address| self.ledgers.contains_key(address))
    }

    pub fn feed(&self, address: &Address) -> Option<&MockV3Aggregator> {
        self.world.feeds.get(address)
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    /// Mint native value into an externally owned account (devnet faucet).
    /// Ledgers and feeds only receive value through transactions.
    pub fn credit(&mut self, account: &Address, amount: Amount) -> Result<(), ChainError> {
        if self.ledgers.contains_key(account) || self.world.feeds.contains_key(account) {
            return Err(ChainError::ContractAccount(*account));
        }
        let credited = self
            .world
            .balance(account)
            .checked_add(amount)
            .ok_or(ChainError::BalanceOverflow(*account))?;
        self.world.balances.insert(*account, credited);
        Ok(())
    }

    pub fn set_rejects_value(&mut self, account: &Address, rejects: bool) {
        if rejects {
            self.world.rejects_value.insert(*account);
        } else {
            self.world.rejects_value.remove(account);
        }
    }

    /// Place an oracle at a fixed address, e.g. the live feed address of a
    /// public network being simulated locally.
    pub fn install_feed(&mut self, address: Address, feed: MockV3Aggregator) {
        self.world.feeds.insert(address, feed);
    }

    pub fn execute(
        &mut self,
        signed: &SignedTransaction,
        timestamp: u64,
    ) -> Result<Receipt, ChainError> {
        let tx = &signed.tx;
        if tx.chain_id != self.chain_id {
            return Err(ChainError::WrongChain {
                expected: self.chain_id,
                got: tx.chain_id,
            });
        }
        let sender = signed.verify()?;
        let expected = self.nonce(&sender);
        if tx.nonce != expected {
            return Err(ChainError::NonceMismatch {
                account: sender,
                expected,
                got: tx.nonce,
            });
        }
        if tx.value > 0 && !tx.call.is_payable() {
            return Err(ChainError::NonPayable);
        }
        let balance = self.balance(&sender);
        if balance < tx.value {
            return Err(ChainError::InsufficientBalance {
                account: sender,
                balance,
                needed: tx.value,
            });
        }
        self.check_target(tx.to, &tx.call)?;

        let tx_hash = signed.hash();
        self.meta.height += 1;
        self.meta.timestamp = timestamp;
        self.meta.last_tx = Some(tx_hash);
        self.nonces.insert(sender, expected + 1);
        debug!(
            height = self.meta.height,
            from = %sender,
            call = ?tx.call,
            value = %tx.value,
            "executing"
        );

        let checkpoint = (self.world.clone(), self.ledgers.clone());
        let (meter, outcome) = self.dispatch(sender, tx.nonce, tx.to, tx.value, &tx.call);

        let mut gas_used = BASE_TX_GAS + meter.gas();
        let (status, contract_address, events) = match outcome {
            Ok(created) => {
                if created.is_some() {
                    gas_used += CREATE_GAS;
                }
                let events = std::mem::take(&mut self.world.pending_events);
                (TxStatus::Success, created, events)
            }
            Err(error) => {
                warn!(height = self.meta.height, from = %sender, %error, "reverted");
                (self.world, self.ledgers) = checkpoint;
                (TxStatus::Reverted { error }, None, Vec::new())
            }
        };

        let receipt = Receipt {
            tx_hash,
            height: self.meta.height,
            from: sender,
            to: tx.to,
            status,
            gas_used,
            contract_address,
            events,
        };
        self.events.extend(receipt.events.iter().cloned());
        self.receipts.push(receipt.clone());
        Ok(receipt)
    }

    fn check_target(&self, to: Option<Address>, call: &Call) -> Result<(), ChainError> {
        match (to, call) {
            (Some(_), c) if c.is_deployment() => Err(ChainError::UnexpectedRecipient),
            (None, c) if c.is_deployment() => Ok(()),
            (None, _) => Err(ChainError::MissingRecipient),
            (Some(to), Call::Fund | Call::Withdraw | Call::OptimizedWithdraw) => {
                if self.ledgers.contains_key(&to) {
                    Ok(())
                } else {
                    Err(ChainError::UnknownContract(to))
                }
            }
            (Some(to), Call::UpdateAnswer { .. }) => {
                if self.world.feeds.contains_key(&to) {
                    Ok(())
                } else {
                    Err(ChainError::UnknownContract(to))
                }
            }
            (Some(to), Call::Receive) => {
                if self.world.feeds.contains_key(&to) {
                    Err(ChainError::NonPayable)
                } else {
                    Ok(())
                }
            }
            (Some(_), _) => Ok(()),
        }
    }

    fn dispatch(
        &mut self,
        sender: Address,
        nonce: u64,
        to: Option<Address>,
        value: Amount,
        call: &Call,
    ) -> (StorageMeter, Result<Option<Address>, FundMeError>) {
        let timestamp = self.meta.timestamp;
        match (call, to) {
            (Call::DeployMockAggregator { decimals, initial_answer }, _) => {
                let address = Address::create(&sender, nonce);
                self.world
                    .feeds
                    .insert(address, MockV3Aggregator::new(*decimals, *initial_answer, timestamp));
                info!(%address, decimals, answer = %initial_answer, "mock aggregator deployed");
                (StorageMeter::default(), Ok(Some(address)))
            }
            (Call::DeployFundMe { price_feed }, _) => {
                let address = Address::create(&sender, nonce);
                self.ledgers.insert(address, FundMe::new(sender, *price_feed));
                info!(%address, owner = %sender, %price_feed, "ledger deployed");
                (StorageMeter::default(), Ok(Some(address)))
            }
            (Call::UpdateAnswer { answer }, Some(to)) => match self.world.feeds.get_mut(&to) {
                Some(feed) => {
                    feed.update_answer(*answer, timestamp);
                    (StorageMeter::default(), Ok(None))
                }
                None => (StorageMeter::default(), Err(FundMeError::OracleUnavailable(to))),
            },
            (_, Some(to)) => {
                if let Err(err) = self.world.transfer(&sender, &to, value) {
                    return (StorageMeter::default(), Err(err));
                }
                let Some(ledger) = self.ledgers.get_mut(&to) else {
                    // plain value send between accounts
                    return (StorageMeter::default(), Ok(None));
                };
                let ctx = CallContext {
                    caller: sender,
                    value,
                    contract: to,
                };
                let result = match call {
                    Call::Fund | Call::Receive => ledger.fund(&mut self.world, &ctx),
                    Call::Withdraw => ledger.withdraw(&mut self.world, &ctx).map(|_| ()),
                    Call::OptimizedWithdraw => {
                        ledger.optimized_withdraw(&mut self.world, &ctx).map(|_| ())
                    }
                    _ => Ok(()),
                };
                (ledger.take_meter(), result.map(|()| None))
            }
            (_, None) => (StorageMeter::default(), Ok(None)),
        }
    }

    /// Merkle root over balances, oracles and ledgers.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (account, balance) in &self.world.balances {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
            hasher.update(self.nonce(account).to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (address, feed) in &self.world.feeds {
            let latest = feed.latest_round_data();
            let mut hasher = Sha256::new();
            hasher.update(b"feed");
            hasher.update(address.as_bytes());
            hasher.update([feed.decimals()]);
            hasher.update(latest.round_id.to_le_bytes());
            hasher.update(latest.answer.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (address, ledger) in &self.ledgers {
            let mut hasher = Sha256::new();
            hasher.update(b"ledger");
            hasher.update(address.as_bytes());
            hasher.update(ledger.owner().as_bytes());
            hasher.update(ledger.price_feed().as_bytes());
            for funder in ledger.funders() {
                hasher.update(funder.as_bytes());
            }
            for (funder, amount) in &ledger.state().amount_funded {
                hasher.update(funder.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
            leaves.push(hasher.finalize().into());
        }
        build_merkle(leaves)
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"fundme-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::Wallet,
        tx::TxBuilder,
        units::WEI_PER_ETHER,
    };

    const DEV_CHAIN: u64 = 31337;

    fn deploy(chain: &mut Chain, owner: &Wallet) -> (Address, Address) {
        let builder = TxBuilder::new(owner, DEV_CHAIN);
        let feed = chain
            .execute(
                &builder.call(
                    0,
                    None,
                    0,
                    Call::DeployMockAggregator {
                        decimals: 8,
                        initial_answer: 130_000_000_000,
                    },
                ),
                1,
            )
            .unwrap()
            .contract_address
            .unwrap();
        let ledger = chain
            .execute(&builder.call(1, None, 0, Call::DeployFundMe { price_feed: feed }), 2)
            .unwrap()
            .contract_address
            .unwrap();
        (feed, ledger)
    }

    #[test]
    fn deployment_creates_feed_and_ledger() {
        let mut chain = Chain::new(DEV_CHAIN);
        let owner = Wallet::generate();
        let (feed, ledger) = deploy(&mut chain, &owner);
        assert_eq!(chain.ledger(&ledger).unwrap().price_feed(), feed);
        assert_eq!(chain.ledger(&ledger).unwrap().owner(), owner.address());
        assert_eq!(chain.nonce(&owner.address()), 2);
        assert_eq!(chain.meta().height, 2);
        assert_eq!(chain.feed(&feed).unwrap().latest_answer(), 130_000_000_000);
        assert_eq!(chain.latest_ledger(), Some(ledger));
    }

    #[test]
    fn reverted_fund_returns_value_and_bumps_nonce() {
        let mut chain = Chain::new(DEV_CHAIN);
        let owner = Wallet::generate();
        let (_, ledger) = deploy(&mut chain, &owner);
        let funder = Wallet::generate();
        chain.credit(&funder.address(), WEI_PER_ETHER).unwrap();
        let root_before = chain.state_root();

        let receipt = chain
            .execute(
                &TxBuilder::new(&funder, DEV_CHAIN).call(0, Some(ledger), 1_000, Call::Fund),
                3,
            )
            .unwrap();
        assert!(matches!(
            receipt.error(),
            Some(FundMeError::InsufficientContribution { .. })
        ));
        assert_eq!(chain.balance(&funder.address()), WEI_PER_ETHER);
        assert_eq!(chain.balance(&ledger), 0);
        assert_eq!(chain.nonce(&funder.address()), 1);
        assert!(chain.events().is_empty());
        assert_ne!(chain.state_root(), root_before);
    }

    #[test]
    fn rejects_bad_nonce_wrong_chain_and_value_on_withdraw() {
        let mut chain = Chain::new(DEV_CHAIN);
        let owner = Wallet::generate();
        let (_, ledger) = deploy(&mut chain, &owner);
        chain.credit(&owner.address(), WEI_PER_ETHER).unwrap();

        let replay = TxBuilder::new(&owner, DEV_CHAIN).call(1, None, 0, Call::DeployFundMe {
            price_feed: Address::ZERO,
        });
        assert!(matches!(
            chain.execute(&replay, 4),
            Err(ChainError::NonceMismatch { expected: 2, got: 1, .. })
        ));

        let foreign = TxBuilder::new(&owner, 5).call(2, Some(ledger), 0, Call::Withdraw);
        assert!(matches!(
            chain.execute(&foreign, 4),
            Err(ChainError::WrongChain { expected: DEV_CHAIN, got: 5 })
        ));

        let paid = TxBuilder::new(&owner, DEV_CHAIN).call(2, Some(ledger), 1, Call::Withdraw);
        assert!(matches!(chain.execute(&paid, 4), Err(ChainError::NonPayable)));
        assert_eq!(chain.nonce(&owner.address()), 2);
    }

    #[test]
    fn receive_funds_the_ledger_and_plain_sends_move_value() {
        let mut chain = Chain::new(DEV_CHAIN);
        let owner = Wallet::generate();
        let (_, ledger) = deploy(&mut chain, &owner);
        let funder = Wallet::generate();
        let friend = Wallet::generate();
        chain.credit(&funder.address(), 2 * WEI_PER_ETHER).unwrap();
        let builder = TxBuilder::new(&funder, DEV_CHAIN);

        let receipt = chain
            .execute(&builder.call(0, Some(ledger), WEI_PER_ETHER, Call::Receive), 5)
            .unwrap();
        assert!(receipt.is_success());
        assert_eq!(
            chain.ledger(&ledger).unwrap().amount_funded(&funder.address()),
            WEI_PER_ETHER
        );

        chain
            .execute(
                &builder.call(1, Some(friend.address()), WEI_PER_ETHER / 2, Call::Receive),
                6,
            )
            .unwrap();
        assert_eq!(chain.balance(&friend.address()), WEI_PER_ETHER / 2);
        assert_eq!(chain.balance(&funder.address()), WEI_PER_ETHER / 2);
    }

    #[test]
    fn state_survives_json_persistence() {
        let mut chain = Chain::new(DEV_CHAIN);
        let owner = Wallet::generate();
        let (_, ledger) = deploy(&mut chain, &owner);
        chain.credit(&owner.address(), WEI_PER_ETHER).unwrap();
        chain
            .execute(
                &TxBuilder::new(&owner, DEV_CHAIN).call(2, Some(ledger), WEI_PER_ETHER, Call::Fund),
                7,
            )
            .unwrap();

        let json = serde_json::to_string(&chain).unwrap();
        let back: Chain = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state_root(), chain.state_root());
        assert_eq!(back.receipts(), chain.receipts());
        assert_eq!(back.ledger(&ledger).unwrap().state(), chain.ledger(&ledger).unwrap().state());
    }

    #[test]
    fn faucet_refuses_contract_accounts() {
        let mut chain = Chain::new(DEV_CHAIN);
        let owner = Wallet::generate();
        let (feed, ledger) = deploy(&mut chain, &owner);

        assert!(matches!(
            chain.credit(&ledger, WEI_PER_ETHER),
            Err(ChainError::ContractAccount(a)) if a == ledger
        ));
        assert!(matches!(
            chain.credit(&feed, WEI_PER_ETHER),
            Err(ChainError::ContractAccount(a)) if a == feed
        ));
        assert_eq!(chain.balance(&ledger), 0);
        assert_eq!(
            chain.balance(&ledger),
            chain.ledger(&ledger).unwrap().total_funded()
        );

        let funder = owner.address();
        chain.credit(&funder, Amount::MAX).unwrap();
        assert!(matches!(
            chain.credit(&funder, 1),
            Err(ChainError::BalanceOverflow(a)) if a == funder
        ));
        assert_eq!(chain.balance(&funder), Amount::MAX);
    }

    #[test]
    fn save_creates_missing_parent_directories() {
        let dir = std::env::temp_dir().join(format!("fundme-state-{}", std::process::id()));
        let path = dir.join("nested").join("devnet.json");
        let chain = Chain::new(DEV_CHAIN);
        chain.save(&path).unwrap();
        assert_eq!(Chain::load(&path).unwrap().chain_id(), DEV_CHAIN);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn empty_state_root_is_fixed() {
        assert_eq!(Chain::new(1).state_root(), Chain::new(2).state_root());
    }
}
