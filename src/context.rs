use std::collections::{BTreeMap, VecDeque};

use crate::address::ContractAddress;
use crate::error::*;
use crate::module::ModuleHandle;

/// 32-byte big-endian amount carried with calls and deployments. Never
/// debited or credited.
pub type Value = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCallRequest {
    pub sender: ContractAddress,
    pub destination: ContractAddress,
    pub value: Value,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct StagedDeployment {
    pub address: ContractAddress,
    pub owner: ContractAddress,
    pub module: ModuleHandle,
}

/// Outcome code of `storageStore`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    Unchanged = 0,
    Added = 1,
    Modified = 2,
    Deleted = 3,
}

impl StorageStatus {
    fn classify(current: Option<&[u8]>, new: &[u8]) -> Self {
        match current {
            Some(old) if old == new => StorageStatus::Unchanged,
            None if new.is_empty() => StorageStatus::Unchanged,
            None => StorageStatus::Added,
            Some(_) if new.is_empty() => StorageStatus::Deleted,
            Some(_) => StorageStatus::Modified,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResultBuffer {
    data: Vec<u8>,
    sealed: bool,
}

impl ResultBuffer {
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.sealed {
            return Err(Error::trap(RESULT_SEALED));
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }


    fn seal(&mut self) -> Vec<u8> {
        self.sealed = true;
        std::mem::take(&mut self.data)
    }
}

/// Everything a finished invocation commits.
#[derive(Default)]
pub struct Effects {
    /// Staged writes in key order; an empty value deletes.
    pub write_set: BTreeMap<Vec<u8>, Vec<u8>>,
    pub deployments: Vec<StagedDeployment>,
    pub nonce: u64,
    pub async_calls: VecDeque<AsyncCallRequest>,
    pub result: Vec<u8>,
}

/// Scratch state of one invocation. Created fresh per call, dropped on a
/// fault and turned into [`Effects`] on success.
pub struct CallContext {
    pub address: ContractAddress,
    pub caller: ContractAddress,
    pub value: Value,
    arguments: Vec<Vec<u8>>,
    write_set: BTreeMap<Vec<u8>, Vec<u8>>,
    deployments: Vec<StagedDeployment>,
    nonce: u64,
    async_queue: VecDeque<AsyncCallRequest>,
    result: ResultBuffer,
}

impl CallContext {
    pub fn new(address: ContractAddress, caller: ContractAddress, value: Value, arguments: Vec<Vec<u8>>, nonce: u64) -> Self {
        Self {
            address,
            caller,
            value,
            arguments,
            write_set: BTreeMap::new(),
            deployments: Vec::new(),
            nonce,
            async_queue: VecDeque::new(),
            result: ResultBuffer::default(),
        }
    }

    pub fn arguments(&self) -> &[Vec<u8>] { &self.arguments }

    pub fn argument(&self, idx: i32) -> Result<&[u8], Error> {
        usize::try_from(idx).ok()
            .and_then(|i| self.arguments.get(i))
            .map(Vec::as_slice)
            .ok_or(Error::IndexOutOfRange(idx as u32))
    }

    /// The staged value of `key`, if this invocation wrote it. An empty
    /// slice means the key was deleted.
    pub fn staged(&self, key: &[u8]) -> Option<&[u8]> {
        self.write_set.get(key).map(Vec::as_slice)
    }

    /// Stages a write given the value currently visible for the key.
    pub fn stage_store(&mut self, key: Vec<u8>, value: Vec<u8>, current: Option<&[u8]>) -> StorageStatus {
        let status = StorageStatus::classify(current.filter(|v| !v.is_empty()), &value);
        if status != StorageStatus::Unchanged {
            self.write_set.insert(key, value);
        }
        status
    }

    /// Reserves the nonce for the next child deployment.
    pub fn next_nonce(&mut self) -> u64 {
        let nonce = self.nonce;
        self.nonce += 1;
        nonce
    }

    pub fn stage_deployment(&mut self, deployment: StagedDeployment) {
        self.deployments.push(deployment);
    }

    pub fn enqueue_async(&mut self, request: AsyncCallRequest) {
        self.async_queue.push_back(request);
    }

    pub fn finish(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.result.append(bytes)
    }

    /// Seals the result buffer and hands out the staged effects.
    pub fn seal(&mut self) -> Effects {
        Effects {
            write_set: std::mem::take(&mut self.write_set),
            deployments: std::mem::take(&mut self.deployments),
            nonce: self.nonce,
            async_calls: std::mem::take(&mut self.async_queue),
            result: self.result.seal(),
        }
    }
}
