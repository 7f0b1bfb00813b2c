//! Native value amounts in wei and their ether rendering.

use thiserror::Error;

pub type Amount = u128;

pub const ETHER_DECIMALS: u32 = 18;
pub const WEI_PER_ETHER: Amount = 1_000_000_000_000_000_000; // 1 ether = 1e18 wei

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitsError {
    #[error("empty amount")]
    Empty,
    #[error("invalid amount {0:?}")]
    Invalid(String),
    #[error("more than 18 fractional digits in {0:?}")]
    TooPrecise(String),
    #[error("amount {0:?} overflows")]
    Overflow(String),
}

/// Parse a decimal ether string (`"0.1"`, `"1"`, `"2.5"`) into wei.
pub fn parse_ether(input: &str) -> Result<Amount, UnitsError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(UnitsError::Empty);
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(UnitsError::Invalid(s.to_string()));
    }
    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if !all_digits(whole) || !all_digits(frac) {
        return Err(UnitsError::Invalid(s.to_string()));
    }
    if frac.len() > ETHER_DECIMALS as usize {
        return Err(UnitsError::TooPrecise(s.to_string()));
    }

    let whole_wei = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<Amount>()
            .map_err(|_| UnitsError::Overflow(s.to_string()))?
            .checked_mul(WEI_PER_ETHER)
            .ok_or_else(|| UnitsError::Overflow(s.to_string()))?
    };
    let frac_wei = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<width$}", width = ETHER_DECIMALS as usize);
        padded
            .parse::<Amount>()
            .map_err(|_| UnitsError::Invalid(s.to_string()))?
    };
    whole_wei
        .checked_add(frac_wei)
        .ok_or_else(|| UnitsError::Overflow(s.to_string()))
}

/// Render wei as ether with trailing zeros trimmed.
pub fn format_ether(wei: Amount) -> String {
    let whole = wei / WEI_PER_ETHER;
    let frac = wei % WEI_PER_ETHER;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0>width$}", width = ETHER_DECIMALS as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
