//! Little-endian value packing.
//!
//! The `Wire` trait provides `serialized_size`/`serialize`/`deserialize`
//! for every value that crosses a socket; the [`wire_packet!`] macro
//! generates tuple-like packet structs implementing it field by field.

use anyhow::{bail, Error};
use bytes::{Buf, BufMut};

use sfs_types::{
    ChunkId, ChunkPartType, ChunkWithVersionAndType, MediaLabel, NetworkAddress, Status,
};

pub trait Wire: Sized {
    fn serialized_size(&self) -> usize;
    fn serialize<B: BufMut>(&self, buf: &mut B);
    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error>;
}

fn need<B: Buf>(buf: &B, bytes: usize) -> Result<(), Error> {
    if buf.remaining() < bytes {
        bail!("truncated packet ({} of {} bytes)", buf.remaining(), bytes);
    }
    Ok(())
}

macro_rules! wire_int {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Wire for $ty {
            fn serialized_size(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn serialize<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
                need(buf, std::mem::size_of::<$ty>())?;
                Ok(buf.$get())
            }
        }
    };
}

wire_int!(u16, put_u16_le, get_u16_le);
wire_int!(u32, put_u32_le, get_u32_le);
wire_int!(u64, put_u64_le, get_u64_le);
wire_int!(i64, put_i64_le, get_i64_le);

impl Wire for u8 {
    fn serialized_size(&self) -> usize {
        1
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        need(buf, 1)?;
        Ok(buf.get_u8())
    }
}

impl Wire for bool {
    fn serialized_size(&self) -> usize {
        1
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self as u8);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Ok(u8::deserialize(buf)? != 0)
    }
}

impl Wire for String {
    fn serialized_size(&self) -> usize {
        4 + self.len()
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let len = u32::deserialize(buf)? as usize;
        need(buf, len)?;
        let mut bytes = vec![0u8; len];
        buf.copy_to_slice(&mut bytes);
        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn serialized_size(&self) -> usize {
        4 + self.iter().map(Wire::serialized_size).sum::<usize>()
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.len() as u32);
        for item in self {
            item.serialize(buf);
        }
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let len = u32::deserialize(buf)? as usize;
        // a length prefix can promise at most the remaining bytes
        if len > buf.remaining() {
            bail!("vector length {} exceeds packet size", len);
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::deserialize(buf)?);
        }
        Ok(items)
    }
}

impl Wire for ChunkId {
    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.0);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Ok(ChunkId(u64::deserialize(buf)?))
    }
}

impl Wire for ChunkPartType {
    fn serialized_size(&self) -> usize {
        2
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.id());
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        ChunkPartType::from_id(u16::deserialize(buf)?)
    }
}

impl Wire for Status {
    fn serialized_size(&self) -> usize {
        1
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self as u8);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let value = u8::deserialize(buf)?;
        match Status::from_u8(value) {
            Some(status) => Ok(status),
            None => bail!("unknown status code {}", value),
        }
    }
}

impl Wire for NetworkAddress {
    fn serialized_size(&self) -> usize {
        6
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.ip);
        buf.put_u16_le(self.port);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let ip = u32::deserialize(buf)?;
        let port = u16::deserialize(buf)?;
        Ok(NetworkAddress { ip, port })
    }
}

impl Wire for ChunkWithVersionAndType {
    fn serialized_size(&self) -> usize {
        8 + 4 + 2
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        self.id.serialize(buf);
        self.version.serialize(buf);
        self.part_type.serialize(buf);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        Ok(Self {
            id: ChunkId::deserialize(buf)?,
            version: u32::deserialize(buf)?,
            part_type: ChunkPartType::deserialize(buf)?,
        })
    }
}

impl Wire for MediaLabel {
    fn serialized_size(&self) -> usize {
        self.to_string().serialized_size()
    }

    fn serialize<B: BufMut>(&self, buf: &mut B) {
        self.to_string().serialize(buf);
    }

    fn deserialize<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let name = String::deserialize(buf)?;
        MediaLabel::new(&name)
    }
}

/// Generate a packet struct with field-by-field `Wire` serialization.
#[macro_export]
macro_rules! wire_packet {
    ($(#[$attr:meta])* $name:ident { $($field:ident : $ty:ty),+ $(,)? }) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $(pub $field: $ty),+
        }

        impl $crate::wire::Wire for $name {
            fn serialized_size(&self) -> usize {
                0 $(+ $crate::wire::Wire::serialized_size(&self.$field))+
            }

            fn serialize<B: bytes::BufMut>(&self, buf: &mut B) {
                $($crate::wire::Wire::serialize(&self.$field, buf);)+
            }

            fn deserialize<B: bytes::Buf>(buf: &mut B) -> Result<Self, anyhow::Error> {
                Ok(Self {
                    $($field: $crate::wire::Wire::deserialize(buf)?),+
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: T) {
        let mut buf = Vec::new();
        value.serialize(&mut buf);
        assert_eq!(buf.len(), value.serialized_size());
        let mut slice = &buf[..];
        let back = T::deserialize(&mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(back, value);
    }

    #[test]
    fn primitives() {
        roundtrip(0xfeu8);
        roundtrip(0xbeefu16);
        roundtrip(0xdeadbeefu32);
        roundtrip(0x0123456789abcdefu64);
        roundtrip(true);
        roundtrip("storage node".to_string());
        roundtrip(vec![1u32, 2, 3]);
    }

    #[test]
    fn domain_types() {
        roundtrip(ChunkId(42));
        roundtrip(ChunkPartType::xor_data(4, 2).unwrap());
        roundtrip(Status::WrongVersion);
        roundtrip(NetworkAddress::new(0x7f000001, 9422));
        roundtrip(ChunkWithVersionAndType::new(
            ChunkId(1),
            7,
            ChunkPartType::standard(),
        ));
        roundtrip(MediaLabel::new("ssd").unwrap());
    }

    #[test]
    fn invalid_part_type_is_refused() {
        // standard slice has only part 0; id 1 is a hole in the id space
        let mut buf = &1u16.to_le_bytes()[..];
        assert!(ChunkPartType::deserialize(&mut buf).is_err());
    }

    #[test]
    fn truncated_input_fails() {
        let mut buf: &[u8] = &[1, 2];
        assert!(u32::deserialize(&mut buf).is_err());
        let mut buf: &[u8] = &[10, 0, 0, 0, b'a'];
        assert!(String::deserialize(&mut buf).is_err());
    }

    #[test]
    fn hostile_vector_length_is_refused() {
        let mut buf: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0, 0];
        assert!(Vec::<u32>::deserialize(&mut buf).is_err());
    }
}
