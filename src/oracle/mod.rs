use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod price_converter;

/// One oracle round, answer scaled by the feed's `decimals`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundData {
    pub round_id: u64,
    pub answer: i128,
    pub started_at: u64,
    pub updated_at: u64,
    pub answered_in_round: u64,
}

/// Read-only view of a reference price source. The ledger only ever asks
/// for the latest round and the decimal count.
pub trait PriceFeed {
    fn decimals(&self) -> u8;

    fn description(&self) -> String;

    fn version(&self) -> u64;

    fn latest_round_data(&self) -> RoundData;
}

/// Local stand-in for an aggregator contract: every update opens a new round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockV3Aggregator {
    decimals: u8,
    latest_answer: i128,
    latest_timestamp: u64,
    latest_round: u64,
    answers: BTreeMap<u64, i128>,
    timestamps: BTreeMap<u64, u64>,
    started_at: BTreeMap<u64, u64>,
}

impl MockV3Aggregator {
    pub const VERSION: u64 = 0;

    pub fn new(decimals: u8, initial_answer: i128, timestamp: u64) -> Self {
        let mut feed = Self {
            decimals,
            latest_answer: 0,
            latest_timestamp: 0,
            latest_round: 0,
            answers: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            started_at: BTreeMap::new(),
        };
        feed.update_answer(initial_answer, timestamp);
        feed
    }

    pub fn update_answer(&mut self, answer: i128, timestamp: u64) {
        self.latest_answer = answer;
        self.latest_timestamp = timestamp;
        self.latest_round += 1;
        self.answers.insert(self.latest_round, answer);
        self.timestamps.insert(self.latest_round, timestamp);
        self.started_at.insert(self.latest_round, timestamp);
    }

    /// Overwrite a specific round; it becomes the latest one.
    pub fn update_round_data(
        &mut self,
        round_id: u64,
        answer: i128,
        timestamp: u64,
        started_at: u64,
    ) {
        self.latest_round = round_id;
        self.latest_answer = answer;
        self.latest_timestamp = timestamp;
        self.answers.insert(round_id, answer);
        self.timestamps.insert(round_id, timestamp);
        self.started_at.insert(round_id, started_at);
    }

    pub fn latest_answer(&self) -> i128 {
        self.latest_answer
    }

    pub fn latest_round(&self) -> u64 {
        self.latest_round
    }

    pub fn get_answer(&self, round_id: u64) -> Option<i128> {
        self.answers.get(&round_id).copied()
    }

    pub fn get_timestamp(&self, round_id: u64) -> Option<u64> {
        self.timestamps.get(&round_id).copied()
    }

    pub fn get_round_data(&self, round_id: u64) -> Option<RoundData> {
        let answer = self.get_answer(round_id)?;
        Some(RoundData {
            round_id,
            answer,
            started_at: self.started_at.get(&round_id).copied().unwrap_or_default(),
            updated_at: self.get_timestamp(round_id).unwrap_or_default(),
            answered_in_round: round_id,
        })
    }
}

impl PriceFeed for MockV3Aggregator {
    fn decimals(&self) -> u8 {
        self.decimals
    }

    fn description(&self) -> String {
        "v0.6/tests/MockV3Aggregator.sol".to_string()
    }

    fn version(&self) -> u64 {
        Self::VERSION
    }

    fn latest_round_data(&self) -> RoundData {
        RoundData {
            round_id: self.latest_round,
            answer: self.latest_answer,
            started_at: self
                .started_at
                .get(&self.latest_round)
                .copied()
                .unwrap_or(self.latest_timestamp),
            updated_at: self.latest_timestamp,
            answered_in_round: self.latest_round,
        }
    }
}
