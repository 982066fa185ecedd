use std::fmt::{Debug, Display, Formatter};

use sha3::{Digest, Keccak256};

/// Two-byte tag identifying this VM inside derived contract addresses.
pub const VM_TYPE: [u8; 2] = [0x05, 0x00];
/// Leading bytes of a contract address that are zero before the VM tag.
const NUM_LEADING_ZEROS: usize = 8;
/// Trailing bytes copied from the creator address.
const SHARD_SUFFIX_LEN: usize = 2;

/// 32-byte account identifier, immutable once assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContractAddress(pub [u8; ContractAddress::LEN]);

impl ContractAddress {
    pub const LEN: usize = 32;

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; Self::LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] { &self.0 }

    /// Address of the contract a creator deploys with the given nonce.
    ///
    /// `keccak256(creator || nonce_le)` with the first eight bytes zeroed,
    /// the VM tag after them, and the creator's last two bytes kept as
    /// suffix so the child lands next to its creator.
    pub fn derive(creator: &ContractAddress, nonce: u64) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(creator.0);
        hasher.update(nonce.to_le_bytes());
        let mut out: [u8; Self::LEN] = hasher.finalize().into();

        out[..NUM_LEADING_ZEROS].fill(0);
        out[NUM_LEADING_ZEROS..NUM_LEADING_ZEROS + VM_TYPE.len()].copy_from_slice(&VM_TYPE);
        out[Self::LEN - SHARD_SUFFIX_LEN..].copy_from_slice(&creator.0[Self::LEN - SHARD_SUFFIX_LEN..]);
        Self(out)
    }

    /// Whether the address carries the smart-contract prefix.
    pub fn is_contract(&self) -> bool {
        self.0[..NUM_LEADING_ZEROS].iter().all(|b| *b == 0)
            && self.0[NUM_LEADING_ZEROS..NUM_LEADING_ZEROS + VM_TYPE.len()] == VM_TYPE
    }
}

impl From<[u8; ContractAddress::LEN]> for ContractAddress {
    fn from(bytes: [u8; ContractAddress::LEN]) -> Self { Self(bytes) }
}

impl std::str::FromStr for ContractAddress {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; Self::LEN];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)?;
        Ok(Self(out))
    }
}

impl Display for ContractAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for ContractAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContractAddress({})", self)
    }
}
