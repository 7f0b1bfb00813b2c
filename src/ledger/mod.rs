use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::FundMeError,
    identity::Address,
    oracle::{price_converter, PriceFeed},
    units::{Amount, WEI_PER_ETHER},
};

/// Minimum contribution in reference units (18 decimals): 50 USD.
pub const MINIMUM_USD: Amount = 50 * WEI_PER_ETHER;

pub const SLOAD_GAS: u64 = 2_100;
pub const SSTORE_GAS: u64 = 5_000;

/// Storage accesses made by the contract during one call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageMeter {
    pub reads: u64,
    pub writes: u64,
}

impl StorageMeter {
    pub fn gas(&self) -> u64 {
        self.reads * SLOAD_GAS + self.writes * SSTORE_GAS
    }
}

/// Who is calling, with how much value, and which deployed instance runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Address,
    pub value: Amount,
    pub contract: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Funded {
        contract: Address,
        funder: Address,
        amount: Amount,
    },
    Withdrawn {
        contract: Address,
        owner: Address,
        amount: Amount,
    },
}

/// Execution environment the contract runs inside: price feeds, native
/// balances and the event sink. The host owns atomicity; the contract never
/// undoes its own writes.
pub trait Host {
    fn price_feed(&self, address: &Address) -> Option<&dyn PriceFeed>;

    fn balance(&self, account: &Address) -> Amount;

    fn transfer(&mut self, from: &Address, to: &Address, amount: Amount) -> Result<(), FundMeError>;

    fn emit(&mut self, event: LedgerEvent);
}

/// Persistent fields of a deployed ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerState {
    pub owner: Address,
    pub price_feed: Address,
    pub funders: Vec<Address>,
    /// Zeroed entries are removed; absent reads as zero.
    pub amount_funded: BTreeMap<Address, Amount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FundMe {
    state: LedgerState,
    #[serde(skip)]
    meter: StorageMeter,
}

impl FundMe {
    /// Deploy a ledger owned by the deploying `owner`, reading prices from
    /// the feed at `price_feed`. Both are fixed for the ledger's lifetime.
    pub fn new(owner: Address, price_feed: Address) -> Self {
        Self {
            state: LedgerState {
                owner,
                price_feed,
                funders: Vec::new(),
                amount_funded: BTreeMap::new(),
            },
            meter: StorageMeter::default(),
        }
    }

    pub fn fund<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        ctx: &CallContext,
    ) -> Result<(), FundMeError> {
        let feed_address = self.sload_price_feed();
        let feed = host
            .price_feed(&feed_address)
            .ok_or(FundMeError::OracleUnavailable(feed_address))?;
        let converted = price_converter::conversion_rate(ctx.value, feed)?;
        if converted < MINIMUM_USD {
            return Err(FundMeError::InsufficientContribution {
                converted,
                minimum: MINIMUM_USD,
            });
        }

        let funded = self
            .sload_amount(&ctx.caller)
            .checked_add(ctx.value)
            .ok_or(FundMeError::ArithmeticOverflow)?;
        self.spush_funder(ctx.caller);
        self.sstore_amount(ctx.caller, funded);

        debug!(contract = %ctx.contract, funder = %ctx.caller, amount = %ctx.value, "funded");
        host.emit(LedgerEvent::Funded {
            contract: ctx.contract,
            funder: ctx.caller,
            amount: ctx.value,
        });
        Ok(())
    }

    /// Clears the registry straight from storage, re-reading the length and
    /// each element every step, then pays the whole balance to the owner.
    pub fn withdraw<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        ctx: &CallContext,
    ) -> Result<Amount, FundMeError> {
        self.only_owner(ctx)?;
        let mut index = 0;
        while index < self.sload_funders_len() {
            let funder = self.sload_funder(index);
            self.sstore_amount(funder, 0);
            index += 1;
        }
        self.sclear_funders();
        self.pay_owner(host, ctx)
    }

    /// Same effect as [`FundMe::withdraw`], but reads the registry once into
    /// memory and clears map entries from that copy.
    pub fn optimized_withdraw<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        ctx: &CallContext,
    ) -> Result<Amount, FundMeError> {
        self.only_owner(ctx)?;
        let funders = self.sload_funders();
        for funder in funders {
            self.sstore_amount(funder, 0);
        }
        self.sclear_funders();
        self.pay_owner(host, ctx)
    }

    pub fn owner(&self) -> Address {
        self.state.owner
    }

    pub fn price_feed(&self) -> Address {
        self.state.price_feed
    }

    pub fn amount_funded(&self, funder: &Address) -> Amount {
        self.state.amount_funded.get(funder).copied().unwrap_or(0)
    }

    pub fn funder(&self, index: usize) -> Result<Address, FundMeError> {
        self.state
            .funders
            .get(index)
            .copied()
            .ok_or(FundMeError::IndexOutOfRange {
                index,
                len: self.state.funders.len(),
            })
    }

    pub fn funders_len(&self) -> usize {
        self.state.funders.len()
    }

    pub fn funders(&self) -> &[Address] {
        &self.state.funders
    }

    pub fn total_funded(&self) -> Amount {
        self.state.amount_funded.values().sum()
    }

    pub fn minimum_usd(&self) -> Amount {
        MINIMUM_USD
    }

    pub fn version<H: Host + ?Sized>(&self, host: &H) -> Result<u64, FundMeError> {
        host.price_feed(&self.state.price_feed)
            .map(|feed| feed.version())
            .ok_or(FundMeError::OracleUnavailable(self.state.price_feed))
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn meter(&self) -> StorageMeter {
        self.meter
    }

    /// Return and reset the storage meter.
    pub fn take_meter(&mut self) -> StorageMeter {
        std::mem::take(&mut self.meter)
    }

    fn only_owner(&self, ctx: &CallContext) -> Result<(), FundMeError> {
        // owner is immutable: no storage read
        if ctx.caller != self.state.owner {
            return Err(FundMeError::NotOwner { caller: ctx.caller });
        }
        Ok(())
    }

    fn pay_owner<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        ctx: &CallContext,
    ) -> Result<Amount, FundMeError> {
        let owner = self.state.owner;
        let amount = host.balance(&ctx.contract);
        host.transfer(&ctx.contract, &owner, amount)?;
        info!(contract = %ctx.contract, owner = %owner, amount = %amount, "withdrawn");
        host.emit(LedgerEvent::Withdrawn {
            contract: ctx.contract,
            owner,
            amount,
        });
        Ok(amount)
    }

    fn sload_price_feed(&mut self) -> Address {
        self.meter.reads += 1;
        self.state.price_feed
    }

    fn sload_funders_len(&mut self) -> usize {
        self.meter.reads += 1;
        self.state.funders.len()
    }

    fn sload_funder(&mut self, index: usize) -> Address {
        self.meter.reads += 1;
        self.state.funders[index]
    }

    fn sload_funders(&mut self) -> Vec<Address> {
        self.meter.reads += 1 + self.state.funders.len() as u64;
        self.state.funders.clone()
    }

    fn sload_amount(&mut self, funder: &Address) -> Amount {
        self.meter.reads += 1;
        self.amount_funded(funder)
    }

    fn spush_funder(&mut self, funder: Address) {
        // length slot read, element and length written
        self.meter.reads += 1;
        self.meter.writes += 2;
        self.state.funders.push(funder);
    }

    fn sstore_amount(&mut self, funder: Address, amount: Amount) {
        self.meter.writes += 1;
        if amount == 0 {
            self.state.amount_funded.remove(&funder);
        } else {
            self.state.amount_funded.insert(funder, amount);
        }
    }

    fn sclear_funders(&mut self) {
        self.meter.writes += 1;
        self.state.funders.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity::Wallet, oracle::MockV3Aggregator};

    const PRICE_2000: i128 = 200_000_000_000;

    struct TestHost {
        feed_address: Address,
        feed: MockV3Aggregator,
        balances: BTreeMap<Address, Amount>,
        refuse: Option<Address>,
        events: Vec<LedgerEvent>,
    }

    impl TestHost {
        fn new(answer: i128) -> Self {
            Self {
                feed_address: Wallet::generate().address(),
                feed: MockV3Aggregator::new(8, answer, 0),
                balances: BTreeMap::new(),
                refuse: None,
                events: Vec::new(),
            }
        }

        fn fund(
            &mut self,
            ledger: &mut FundMe,
            contract: Address,
            caller: Address,
            value: Amount,
        ) -> Result<(), FundMeError> {
            *self.balances.entry(contract).or_default() += value;
            ledger.fund(self, &CallContext { caller, value, contract })
        }
    }

    impl Host for TestHost {
        fn price_feed(&self, address: &Address) -> Option<&dyn PriceFeed> {
            (*address == self.feed_address).then_some(&self.feed as &dyn PriceFeed)
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
            if self.refuse == Some(*to) || self.balance(from) < amount {
                return Err(FundMeError::TransferFailed { to: *to, amount });
            }
            *self.balances.entry(*from).or_default() -= amount;
            *self.balances.entry(*to).or_default() += amount;
            Ok(())
        }

        fn emit(&mut self, event: LedgerEvent) {
            self.events.push(event);
        }
    }

    fn setup() -> (TestHost, FundMe, Address, Address) {
        let host = TestHost::new(PRICE_2000);
        let owner = Wallet::generate().address();
        let contract = Address::create(&owner, 0);
        let ledger = FundMe::new(owner, host.feed_address);
        (host, ledger, owner, contract)
    }

    #[test]
    fn constructor_wires_owner_and_feed() {
        let (host, ledger, owner, _) = setup();
        assert_eq!(ledger.owner(), owner);
        assert_eq!(ledger.price_feed(), host.feed_address);
        assert_eq!(ledger.funders_len(), 0);
        assert_eq!(ledger.version(&host).unwrap(), MockV3Aggregator::VERSION);
    }

    #[test]
    fn fund_records_amount_and_funder() {
        let (mut host, mut ledger, _, contract) = setup();
        let alice = Wallet::generate().address();
        host.fund(&mut ledger, contract, alice, WEI_PER_ETHER).unwrap();
        host.fund(&mut ledger, contract, alice, WEI_PER_ETHER).unwrap();
        assert_eq!(ledger.amount_funded(&alice), 2 * WEI_PER_ETHER);
        assert_eq!(ledger.funders(), &[alice, alice]);
        assert_eq!(host.balance(&contract), ledger.total_funded());
        assert_eq!(host.events.len(), 2);
    }

    #[test]
    fn fund_below_minimum_is_rejected_without_state_change() {
        let (mut host, mut ledger, _, contract) = setup();
        let before = ledger.state().clone();
        let err = ledger
            .fund(
                &mut host,
                &CallContext {
                    caller: Wallet::generate().address(),
                    value: 0,
                    contract,
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            FundMeError::InsufficientContribution {
                converted: 0,
                minimum: MINIMUM_USD
            }
        );
        assert_eq!(ledger.state(), &before);
        assert!(host.events.is_empty());
    }

    #[test]
    fn fund_without_reachable_feed_fails() {
        let owner = Wallet::generate().address();
        let missing = Wallet::generate().address();
        let mut ledger = FundMe::new(owner, missing);
        let mut host = TestHost::new(PRICE_2000);
        let err = ledger
            .fund(
                &mut host,
                &CallContext {
                    caller: owner,
                    value: WEI_PER_ETHER,
                    contract: Address::create(&owner, 0),
                },
            )
            .unwrap_err();
        assert_eq!(err, FundMeError::OracleUnavailable(missing));
    }

    #[test]
    fn funder_lookup_out_of_range() {
        let (mut host, mut ledger, _, contract) = setup();
        assert_eq!(
            ledger.funder(0),
            Err(FundMeError::IndexOutOfRange { index: 0, len: 0 })
        );

        let alice = Wallet::generate().address();
        let bob = Wallet::generate().address();
        host.fund(&mut ledger, contract, alice, WEI_PER_ETHER).unwrap();
        host.fund(&mut ledger, contract, bob, WEI_PER_ETHER).unwrap();
        assert_eq!(ledger.funder(0), Ok(alice));
        assert_eq!(ledger.funder(1), Ok(bob));
        assert_eq!(
            ledger.funder(2),
            Err(FundMeError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(
            ledger.funder(usize::MAX),
            Err(FundMeError::IndexOutOfRange {
                index: usize::MAX,
                len: 2
            })
        );
    }

    #[test]
    fn both_withdrawals_agree_but_optimized_reads_less() {
        let (mut host, mut ledger, owner, contract) = setup();
        for _ in 0..3 {
            let funder = Wallet::generate().address();
            host.fund(&mut ledger, contract, funder, WEI_PER_ETHER).unwrap();
            host.fund(&mut ledger, contract, funder, WEI_PER_ETHER / 10).unwrap();
        }
        ledger.take_meter();

        let ctx = CallContext {
            caller: owner,
            value: 0,
            contract,
        };
        let mut standard = ledger.clone();
        let mut standard_host = TestHost {
            feed_address: host.feed_address,
            feed: host.feed.clone(),
            balances: host.balances.clone(),
            refuse: None,
            events: Vec::new(),
        };
        let mut optimized = ledger.clone();

        let paid_standard = standard.withdraw(&mut standard_host, &ctx).unwrap();
        let paid_optimized = optimized.optimized_withdraw(&mut host, &ctx).unwrap();

        assert_eq!(paid_standard, paid_optimized);
        assert_eq!(paid_standard, 33 * WEI_PER_ETHER / 10);
        assert_eq!(standard.state(), optimized.state());
        assert_eq!(standard_host.balances, host.balances);
        assert_eq!(standard.meter().writes, optimized.meter().writes);
        assert_eq!(standard.meter().reads, 2 * 6 + 1);
        assert_eq!(optimized.meter().reads, 1 + 6);
        assert!(optimized.meter().gas() < standard.meter().gas());
    }

    #[test]
    fn withdraw_requires_owner() {
        let (mut host, mut ledger, _, contract) = setup();
        let stranger = Wallet::generate().address();
        host.fund(&mut ledger, contract, stranger, WEI_PER_ETHER).unwrap();
        let ctx = CallContext {
            caller: stranger,
            value: 0,
            contract,
        };
        assert_eq!(
            ledger.withdraw(&mut host, &ctx),
            Err(FundMeError::NotOwner { caller: stranger })
        );
        assert_eq!(
            ledger.optimized_withdraw(&mut host, &ctx),
            Err(FundMeError::NotOwner { caller: stranger })
        );
        assert_eq!(ledger.amount_funded(&stranger), WEI_PER_ETHER);
        assert_eq!(host.balance(&contract), WEI_PER_ETHER);
    }

    #[test]
    fn refused_transfer_surfaces_as_transfer_failed() {
        let (mut host, mut ledger, owner, contract) = setup();
        host.fund(&mut ledger, contract, owner, WEI_PER_ETHER).unwrap();
        host.refuse = Some(owner);
        let err = ledger
            .withdraw(
                &mut host,
                &CallContext {
                    caller: owner,
                    value: 0,
                    contract,
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            FundMeError::TransferFailed {
                to: owner,
                amount: WEI_PER_ETHER
            }
        );
    }
}
