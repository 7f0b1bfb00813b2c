//! Custodial funding ledger with oracle-gated deposits.
//!
//! The crate is split into small pieces that the `fundme` binary wires
//! together:
//!
//! * [`ledger`]: the contract itself: funder registry, minimum-contribution
//!   gate, owner-only withdrawal in a standard and a storage-optimized form.
//! * [`oracle`]: the price feed capability the ledger reads, a mock
//!   aggregator for local networks and the price conversion helpers.
//! * [`chain`]: a single-process execution environment that holds native
//!   balances, runs signed transactions all-or-nothing and keeps receipts.
//! * [`tx`] / [`identity`]: signed call envelopes and ed25519 backed
//!   addresses.
//! * [`config`] / [`deploy`]: network table and the deployment steps that
//!   pick a mock or a live price feed.

pub mod chain;
pub mod config;
pub mod deploy;
pub mod identity;
pub mod ledger;
pub mod oracle;
pub mod tx;
pub mod units;

mod error;

pub use error::FundMeError;
pub use identity::{Address, Wallet};
pub use units::Amount;
