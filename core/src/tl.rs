//! TL serialization helpers for chain primitives.

use tl_proto::{TlPacket, TlRead, TlResult};

pub mod hash_bytes {
    use tycho_types::cell::HashBytes;

    use super::*;

    pub const SIZE_HINT: usize = 32;

    pub const fn size_hint(_: &HashBytes) -> usize {
        SIZE_HINT
    }

    #[inline]
    pub fn write<P: TlPacket>(hash_bytes: &HashBytes, packet: &mut P) {
        packet.write_raw_slice(hash_bytes.as_ref());
    }

    #[inline]
    pub fn read(data: &[u8], offset: &mut usize) -> TlResult<HashBytes> {
        <&[u8; 32]>::read_from(data, offset).map(|bytes| HashBytes::from(*bytes))
    }
}

pub mod hash_bytes_vec {
    use tycho_types::cell::HashBytes;

    use super::*;

    pub fn size_hint(items: &[HashBytes]) -> usize {
        4 + items.len() * 32
    }

    pub fn write<P: TlPacket>(items: &[HashBytes], packet: &mut P) {
        packet.write_u32(items.len() as u32);
        for item in items {
            packet.write_raw_slice(item.as_ref());
        }
    }

    pub fn read(data: &[u8], offset: &mut usize) -> TlResult<Vec<HashBytes>> {
        let len = u32::read_from(data, offset)? as usize;
        let mut items = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            let bytes = <&[u8; 32]>::read_from(data, offset)?;
            items.push(HashBytes::from(*bytes));
        }
        Ok(items)
    }
}
