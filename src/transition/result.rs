/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use std::io::Cursor;

use crate::codec;
use crate::error::{Error, Result};
use crate::world::StateHash;

/// The on-disk form of a transition's outcome: `(stateHash, patchReceiptHash,
/// normalReceiptHash)`, chained from block to block as the `result` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionResult {
    pub state_hash: StateHash,
    pub patch_receipt_hash: [u8; 32],
    pub normal_receipt_hash: [u8; 32],
}

impl TransitionResult {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        codec::encode_bytes(&mut out, &self.state_hash);
        codec::encode_bytes(&mut out, &self.patch_receipt_hash);
        codec::encode_bytes(&mut out, &self.normal_receipt_hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let state_hash = codec::decode_bytes(&mut cur)?;
        let patch_receipt_hash = codec::decode_bytes(&mut cur)?;
        let normal_receipt_hash = codec::decode_bytes(&mut cur)?;
        Ok(Self {
            state_hash: to_array(&state_hash)?,
            patch_receipt_hash: to_array(&patch_receipt_hash)?,
            normal_receipt_hash: to_array(&normal_receipt_hash)?,
        })
    }
}

fn to_array(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Error::Configuration("malformed transition result bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let tr = TransitionResult {
            state_hash: [1; 32],
            patch_receipt_hash: [2; 32],
            normal_receipt_hash: [3; 32],
        };
        let bytes = tr.to_bytes();
        assert_eq!(TransitionResult::from_bytes(&bytes).unwrap(), tr);
    }
}
