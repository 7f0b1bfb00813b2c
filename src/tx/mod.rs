use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    identity::{Address, Wallet},
    units::Amount,
};

/// What a transaction asks the chain to do.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    /// Contribute the attached value to the ledger at `to`.
    Fund,
    Withdraw,
    OptimizedWithdraw,
    /// Bare value send. A ledger treats it as `Fund`.
    Receive,
    DeployMockAggregator { decimals: u8, initial_answer: i128 },
    DeployFundMe { price_feed: Address },
    /// Push a new answer to the mock aggregator at `to`.
    UpdateAnswer { answer: i128 },
}

impl Call {
    pub fn is_payable(&self) -> bool {
        matches!(self, Call::Fund | Call::Receive)
    }

    pub fn is_deployment(&self) -> bool {
        matches!(
            self,
            Call::DeployMockAggregator { .. } | Call::DeployFundMe { .. }
        )
    }

    fn commitment(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Call::Fund => buf.push(0),
            Call::Withdraw => buf.push(1),
            Call::OptimizedWithdraw => buf.push(2),
            Call::Receive => buf.push(3),
            Call::DeployMockAggregator {
                decimals,
                initial_answer,
            } => {
                buf.push(4);
                buf.push(*decimals);
                buf.extend_from_slice(&initial_answer.to_le_bytes());
            }
            Call::DeployFundMe { price_feed } => {
                buf.push(5);
                buf.extend_from_slice(price_feed.as_bytes());
            }
            Call::UpdateAnswer { answer } => {
                buf.push(6);
                buf.extend_from_slice(&answer.to_le_bytes());
            }
        }
        buf
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub chain_id: u64,
    #[serde(with = "crate::tx::serde_hex32")]
    pub from: [u8; 32],
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: Amount,
    pub call: Call,
}

impl Transaction {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"fundme-tx");
        hasher.update(self.chain_id.to_le_bytes());
        hasher.update(self.from);
        hasher.update(self.nonce.to_le_bytes());
        match &self.to {
            Some(to) => {
                hasher.update([1u8]);
                hasher.update(to.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.value.to_le_bytes());
        hasher.update(self.call.commitment());
        hasher.finalize().into()
    }

    pub fn sign(self, wallet: &Wallet) -> SignedTransaction {
        let signature = wallet.sign(&self.digest()).to_bytes().to_vec();
        SignedTransaction {
            tx: self,
            signature,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: Transaction,
    #[serde(with = "crate::tx::serde_b64")]
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    pub fn hash(&self) -> [u8; 32] {
        self.tx.digest()
    }

    /// Address of the signing key; only meaningful once `verify` passed.
    pub fn sender(&self) -> Result<Address, TxError> {
        let key = VerifyingKey::from_bytes(&self.tx.from).map_err(|_| TxError::MalformedKey)?;
        Ok(Address::from_verifying_key(&key))
    }

    pub fn verify(&self) -> Result<Address, TxError> {
        let key = VerifyingKey::from_bytes(&self.tx.from).map_err(|_| TxError::MalformedKey)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TxError::MalformedSignature)?;
        key.verify_strict(&self.tx.digest(), &signature)
            .map_err(|_| TxError::InvalidSignature)?;
        Ok(Address::from_verifying_key(&key))
    }
}

/// Builder for transactions originating from one wallet.
pub struct TxBuilder<'a> {
    wallet: &'a Wallet,
    chain_id: u64,
}

impl<'a> TxBuilder<'a> {
    pub fn new(wallet: &'a Wallet, chain_id: u64) -> Self {
        Self { wallet, chain_id }
    }

    pub fn call(
        &self,
        nonce: u64,
        to: Option<Address>,
        value: Amount,
        call: Call,
    ) -> SignedTransaction {
        Transaction {
            chain_id: self.chain_id,
            from: self.wallet.verifying_key().to_bytes(),
            nonce,
            to,
            value,
            call,
        }
        .sign(self.wallet)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TxError {
    #[error("malformed sender key")]
    MalformedKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("invalid signature")]
    InvalidSignature,
}

pub(crate) mod serde_b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

pub(crate) mod serde_hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_transaction_verifies_and_names_sender() {
        let wallet = Wallet::generate();
        let contract = Address::create(&wallet.address(), 0);
        let signed = TxBuilder::new(&wallet, 31337).call(0, Some(contract), 10, Call::Fund);
        assert_eq!(signed.verify().unwrap(), wallet.address());
        assert_eq!(signed.sender().unwrap(), wallet.address());
    }

    #[test]
    fn tampering_breaks_signature() {
        let wallet = Wallet::generate();
        let mut signed = TxBuilder::new(&wallet, 31337).call(0, None, 0, Call::Withdraw);
        signed.tx.value = 1;
        assert_eq!(signed.verify(), Err(TxError::InvalidSignature));

        let other = Wallet::generate();
        let mut forged = TxBuilder::new(&other, 31337).call(0, None, 0, Call::Withdraw);
        forged.tx.from = wallet.verifying_key().to_bytes();
        assert_eq!(forged.verify(), Err(TxError::InvalidSignature));
    }

    #[test]
    fn json_round_trip_keeps_signature_valid() {
        let wallet = Wallet::generate();
        let signed = TxBuilder::new(&wallet, 5).call(
            3,
            None,
            0,
            Call::DeployMockAggregator {
                decimals: 8,
                initial_answer: 130_000_000_000,
            },
        );
        let json = serde_json::to_string(&signed).unwrap();
        let back: SignedTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signed);
        back.verify().unwrap();
    }

    #[test]
    fn calls_commit_to_distinct_digests() {
        let wallet = Wallet::generate();
        let builder = TxBuilder::new(&wallet, 1);
        let a = builder.call(0, None, 0, Call::Withdraw);
        let b = builder.call(0, None, 0, Call::OptimizedWithdraw);
        assert_ne!(a.hash(), b.hash());
    }
}
