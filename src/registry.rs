use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::address::ContractAddress;
use crate::error::Error;
use crate::module::ModuleHandle;

/// Persistent key/value storage of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageScope {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

static EMPTY_SCOPE: StorageScope = StorageScope::new();

impl StorageScope {
    pub const fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// The value under `key` truncated or zero-padded to `len` bytes.
    pub fn load(&self, key: &[u8], len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if let Some(value) = self.get(key) {
            let n = value.len().min(len);
            out[..n].copy_from_slice(&value[..n]);
        }
        out
    }

    /// Stores `value`; an empty value removes the key.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if value.is_empty() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

#[derive(Clone, Default)]
pub struct Account {
    pub module: Option<ModuleHandle>,
    pub owner: Option<ContractAddress>,
    pub code_metadata: Vec<u8>,
    pub nonce: u64,
    pub storage: StorageScope,
}

/// All accounts known to the engine. Accounts without code only carry a
/// nonce, e.g. external creators.
#[derive(Clone, Default)]
pub struct ContractRegistry {
    accounts: HashMap<ContractAddress, Account>,
}

impl ContractRegistry {
    pub fn new() -> Self { Self::default() }

    /// Installs `module` at `address`, creating the account if needed.
    /// Existing storage is kept.
    pub fn deploy(&mut self, address: ContractAddress, module: ModuleHandle) {
        debug!(%address, "contract deployed");
        self.accounts.entry(address).or_default().module = Some(module);
    }

    /// Replaces the code of an existing contract.
    pub fn upgrade(&mut self, address: &ContractAddress, module: ModuleHandle) -> Result<(), Error> {
        match self.accounts.get_mut(address) {
            Some(Account { module: slot @ Some(_), .. }) => {
                *slot = Some(module);
                debug!(%address, "contract upgraded");
                Ok(())
            }
            _ => Err(Error::NotFound(*address)),
        }
    }

    pub fn get(&self, address: &ContractAddress) -> Result<ModuleHandle, Error> {
        self.accounts.get(address)
            .and_then(|acct| acct.module.clone())
            .ok_or(Error::NotFound(*address))
    }

    pub fn contains(&self, address: &ContractAddress) -> bool {
        self.accounts.get(address).is_some_and(|acct| acct.module.is_some())
    }

    pub fn account(&self, address: &ContractAddress) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn account_mut(&mut self, address: ContractAddress) -> &mut Account {
        self.accounts.entry(address).or_default()
    }

    /// Committed storage of `address`; empty for unknown accounts.
    pub fn storage_scope(&self, address: &ContractAddress) -> &StorageScope {
        self.accounts.get(address).map(|acct| &acct.storage).unwrap_or(&EMPTY_SCOPE)
    }

    pub fn storage_scope_mut(&mut self, address: ContractAddress) -> &mut StorageScope {
        &mut self.account_mut(address).storage
    }

    pub fn nonce(&self, address: &ContractAddress) -> u64 {
        self.accounts.get(address).map_or(0, |acct| acct.nonce)
    }

    pub fn set_nonce(&mut self, address: ContractAddress, nonce: u64) {
        self.account_mut(address).nonce = nonce;
    }

    pub fn owner(&self, address: &ContractAddress) -> Option<ContractAddress> {
        self.accounts.get(address).and_then(|acct| acct.owner)
    }

    pub fn code_metadata(&self, address: &ContractAddress) -> Option<&[u8]> {
        self.accounts.get(address)
            .filter(|acct| acct.module.is_some())
            .map(|acct| acct.code_metadata.as_slice())
    }
}
