/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The project's canonical deterministic binary codec.
//!
//! Integers are encoded big-endian; byte strings are length-prefixed with a
//! big-endian `u32` length. Used for database keys, [TransitionResult](crate::transition::TransitionResult)
//! bytes, and encoded [Block](crate::block::Block)s — anywhere a stable,
//! platform-independent encoding that can be chained from block to block.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub fn encode_u64(out: &mut Vec<u8>, v: u64) {
    out.write_u64::<BigEndian>(v).expect("Vec<u8> write cannot fail");
}

pub fn decode_u64(cur: &mut Cursor<&[u8]>) -> io::Result<u64> {
    cur.read_u64::<BigEndian>()
}

pub fn encode_i64(out: &mut Vec<u8>, v: i64) {
    out.write_i64::<BigEndian>(v).expect("Vec<u8> write cannot fail");
}

pub fn decode_i64(cur: &mut Cursor<&[u8]>) -> io::Result<i64> {
    cur.read_i64::<BigEndian>()
}

/// Length-prefixed byte string: a big-endian `u32` length followed by the bytes.
pub fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.write_u32::<BigEndian>(bytes.len() as u32)
        .expect("Vec<u8> write cannot fail");
    out.extend_from_slice(bytes);
}

pub fn decode_bytes(cur: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = cur.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

/// Encode a height as a fixed-width big-endian key, so that lexicographic
/// byte order on the key matches numeric order on the height.
pub fn height_key(height: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    encode_u64(&mut out, height);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_u64() {
        let mut buf = Vec::new();
        encode_u64(&mut buf, 1234567890123);
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(decode_u64(&mut cur).unwrap(), 1234567890123);
    }

    #[test]
    fn round_trips_bytes() {
        let mut buf = Vec::new();
        encode_bytes(&mut buf, b"hello world");
        let mut cur = Cursor::new(buf.as_slice());
        assert_eq!(decode_bytes(&mut cur).unwrap(), b"hello world".to_vec());
    }

    #[test]
    fn height_keys_sort_numerically() {
        let mut keys: Vec<Vec<u8>> = (0..300).map(height_key).collect();
        let heights_in_key_order: Vec<u64> = {
            let mut sorted = keys.clone();
            sorted.sort();
            sorted
                .iter()
                .map(|k| u64::from_be_bytes(k.as_slice().try_into().unwrap()))
                .collect()
        };
        keys.sort();
        let expect: Vec<u64> = (0..300).collect();
        assert_eq!(heights_in_key_order, expect);
    }
}
