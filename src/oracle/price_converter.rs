//! Conversion of native amounts into reference-currency units.
//!
//! `reference = amount * price / 10^decimals`. With an 18-decimal native
//! amount and an 8-decimal feed this yields reference units with 18 decimals,
//! the same scale as [`crate::ledger::MINIMUM_USD`].

use crate::{error::FundMeError, oracle::PriceFeed, units::Amount};

/// Latest positive answer from the feed, still scaled by its decimals.
pub fn price(feed: &dyn PriceFeed) -> Result<Amount, FundMeError> {
    let answer = feed.latest_round_data().answer;
    if answer <= 0 {
        return Err(FundMeError::InvalidPrice { answer });
    }
    Amount::try_from(answer).map_err(|_| FundMeError::InvalidPrice { answer })
}

pub fn conversion_rate(amount: Amount, feed: &dyn PriceFeed) -> Result<Amount, FundMeError> {
    let price = price(feed)?;
    let scale = 10u128
        .checked_pow(u32::from(feed.decimals()))
        .ok_or(FundMeError::ArithmeticOverflow)?;
    amount
        .checked_mul(price)
        .map(|v| v / scale)
        .ok_or(FundMeError::ArithmeticOverflow)
}
