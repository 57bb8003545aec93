//! Binary encoding primitives shared by the storage format: LEB128 varints
//! and protobuf-style field helpers for the persisted metadata and slot
//! records.

pub mod varint;
pub mod wire;

use crc::{Crc, CRC_64_ECMA_182};

/// Checksum guarding serialized metadata regions.
pub const META_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
