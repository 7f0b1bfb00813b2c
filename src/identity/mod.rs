use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const ADDRESS_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// 20-byte account identity. Externally owned accounts derive it from their
/// ed25519 key, contracts from their deployer and nonce.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self::from_digest(Sha256::digest(key.as_bytes()).into())
    }

    /// Address of the contract created by `deployer` at `nonce`.
    pub fn create(deployer: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"create");
        hasher.update(deployer.0);
        hasher.update(nonce.to_le_bytes());
        Self::from_digest(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    fn from_digest(digest: [u8; 32]) -> Self {
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[32 - ADDRESS_LEN..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let raw = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = hex::decode(raw)?;
        let arr: [u8; ADDRESS_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::InvalidLength {
                    expected: ADDRESS_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Address(arr))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

/// An ed25519 keypair acting as an externally owned account.
#[derive(Clone)]
pub struct Wallet {
    signing_key: SigningKey,
}

impl Wallet {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Load from a 32-byte secret in hex (64 characters).
    pub fn from_secret_hex(secret: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(secret.trim())?;
        let arr: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::InvalidLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;
        Ok(Self::from_secret_bytes(&arr))
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn address(&self) -> Address {
        Address::from_verifying_key(&self.verifying_key())
    }

    pub fn sign(&self, digest: &[u8]) -> Signature {
        self.signing_key.sign(digest)
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let wallet = Wallet::generate();
        let addr = wallet.address();
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
        assert!(addr.to_string().starts_with("0x"));
        assert_eq!(addr.to_string().len(), 2 + 2 * ADDRESS_LEN);
    }

    #[test]
    fn parses_checksummed_feed_address() {
        let addr: Address = "0xF9680D99D6C9589e2a93a78A04A279e509205945"
            .parse()
            .unwrap();
        assert_eq!(
            addr.to_string(),
            "0xf9680d99d6c9589e2a93a78a04a279e509205945"
        );
        assert!(matches!(
            "0x1234".parse::<Address>(),
            Err(IdentityError::InvalidLength { actual: 2, .. })
        ));
    }

    #[test]
    fn wallet_reloads_from_secret() {
        let wallet = Wallet::generate();
        let again = Wallet::from_secret_hex(&wallet.secret_hex()).unwrap();
        assert_eq!(wallet.address(), again.address());
        assert_eq!(wallet.public_hex(), again.public_hex());
    }

    #[test]
    fn contract_addresses_depend_on_nonce() {
        let deployer = Wallet::generate().address();
        assert_ne!(Address::create(&deployer, 0), Address::create(&deployer, 1));
        assert_eq!(Address::create(&deployer, 3), Address::create(&deployer, 3));
    }
}
