use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{identity::Address, units::Amount};

/// Errors raised by the ledger contract. Any of them aborts the whole call.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundMeError {
    /// Contribution converts to less than the minimum reference amount.
    #[error("you need to spend more: converted {converted}, minimum {minimum}")]
    InsufficientContribution { converted: Amount, minimum: Amount },

    /// Withdrawal attempted by someone other than the owner.
    #[error("caller {caller} is not the owner")]
    NotOwner { caller: Address },

    /// Native value transfer was refused by the recipient or underfunded.
    #[error("transfer of {amount} to {to} failed")]
    TransferFailed { to: Address, amount: Amount },

    /// Funder lookup past the end of the registry.
    #[error("funder index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// Oracle answered with a non-positive price.
    #[error("invalid oracle price {answer}")]
    InvalidPrice { answer: i128 },

    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// No price feed is reachable at the configured address.
    #[error("no price feed at {0}")]
    OracleUnavailable(Address),
}
