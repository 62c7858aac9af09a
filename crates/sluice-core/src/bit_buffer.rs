//! Bit-addressable growable buffer.
//!
//! Values are packed least-significant bit first, so byte-aligned integers end up in
//! little-endian order. Writes append at the current bit length; reads advance an
//! independent cursor and fail with [`ErrorKind::BufferUnderrun`] instead of reading
//! past the written data.
//!
//! Message types describe their own layout through [`Encode`]/[`Decode`]: each
//! implementation lists its fields in a fixed order, so there is no runtime type
//! lookup.

use crate::{
    constants::BUFFER_OVERALLOCATE_AMOUNT,
    error::{DecodingErrorKind, ErrorKind, Result},
};

/// Growable buffer addressed in bits.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BitBuffer {
    data: Vec<u8>,
    bit_length: usize,
    read_position: usize,
}

/// Writes a value into a [`BitBuffer`] in a fixed field order.
pub trait Encode {
    /// Appends `self` to `buffer`.
    fn encode(&self, buffer: &mut BitBuffer);
}

/// Reads a value written by the matching [`Encode`] implementation.
pub trait Decode: Sized {
    /// Reads one value from `buffer`, advancing its read cursor.
    fn decode(buffer: &mut BitBuffer) -> Result<Self>;
}

impl BitBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with room for `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self { data: Vec::with_capacity(bytes), bit_length: 0, read_position: 0 }
    }

    /// Wraps recycled storage; the existing contents are discarded.
    pub fn from_storage(mut data: Vec<u8>) -> Self {
        data.clear();
        Self { data, bit_length: 0, read_position: 0 }
    }

    /// Wraps `bytes` as a fully written buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let bit_length = bytes.len() * 8;
        Self { data: bytes, bit_length, read_position: 0 }
    }

    /// Wraps `bytes` holding exactly `bit_length` meaningful bits.
    pub fn from_parts(mut bytes: Vec<u8>, bit_length: usize) -> Self {
        let needed = bit_length.div_ceil(8);
        if bytes.len() < needed {
            bytes.resize(needed, 0);
        }
        Self { data: bytes, bit_length, read_position: 0 }
    }

    /// Written bytes; the last byte may be partially used.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.length_bytes()]
    }

    /// Written length in bits.
    pub fn length_bits(&self) -> usize {
        self.bit_length
    }

    /// Written length in bytes, rounded up.
    pub fn length_bytes(&self) -> usize {
        self.bit_length.div_ceil(8)
    }

    /// Read cursor in bits.
    pub fn read_position(&self) -> usize {
        self.read_position
    }

    /// Moves the read cursor; clamped to the written length.
    pub fn set_read_position(&mut self, bits: usize) {
        self.read_position = bits.min(self.bit_length);
    }

    /// Bits left to read.
    pub fn remaining_bits(&self) -> usize {
        self.bit_length - self.read_position
    }

    /// Discards the contents but keeps the storage.
    pub fn clear(&mut self) {
        self.data.clear();
        self.bit_length = 0;
        self.read_position = 0;
    }

    /// Consumes the buffer, returning storage truncated to the written bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.length_bytes());
        self.data
    }

    fn ensure_bit_capacity(&mut self, bits: usize) {
        let needed = bits.div_ceil(8);
        if self.data.len() < needed {
            self.data.resize(needed + BUFFER_OVERALLOCATE_AMOUNT, 0);
        }
    }

    fn check_remaining(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining_bits();
        if needed > remaining {
            return Err(ErrorKind::BufferUnderrun { needed, remaining });
        }
        Ok(())
    }

    /// Appends the low `bits` bits of `value`.
    pub fn write_bits(&mut self, mut value: u64, bits: u32) {
        debug_assert!(bits <= 64);
        self.ensure_bit_capacity(self.bit_length + bits as usize);
        let mut left = bits;
        while left > 0 {
            let byte = self.bit_length / 8;
            let offset = (self.bit_length % 8) as u32;
            let take = (8 - offset).min(left);
            let mask = ((1u16 << take) - 1) as u8;
            let chunk = (value as u8) & mask;
            self.data[byte] = (self.data[byte] & !(mask << offset)) | (chunk << offset);
            value = value.checked_shr(take).unwrap_or(0);
            self.bit_length += take as usize;
            left -= take;
        }
    }

    fn peek_bits_at(&self, mut position: usize, bits: u32) -> u64 {
        let mut value = 0u64;
        let mut done = 0u32;
        while done < bits {
            let byte = self.data[position / 8];
            let offset = (position % 8) as u32;
            let take = (8 - offset).min(bits - done);
            let mask = ((1u16 << take) - 1) as u8;
            value |= (((byte >> offset) & mask) as u64) << done;
            position += take as usize;
            done += take;
        }
        value
    }

    /// Reads `bits` bits into the low end of a `u64`.
    pub fn read_bits(&mut self, bits: u32) -> Result<u64> {
        debug_assert!(bits <= 64);
        self.check_remaining(bits as usize)?;
        let value = self.peek_bits_at(self.read_position, bits);
        self.read_position += bits as usize;
        Ok(value)
    }

    /// Reads `bits` bits without moving the cursor.
    pub fn peek_bits(&self, bits: u32) -> Result<u64> {
        self.check_remaining(bits as usize)?;
        Ok(self.peek_bits_at(self.read_position, bits))
    }

    /// Appends a single-bit flag.
    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u64, 1);
    }

    /// Reads a single-bit flag.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Appends a byte.
    pub fn write_u8(&mut self, value: u8) {
        self.write_bits(value as u64, 8);
    }

    /// Reads a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Reads a byte without moving the cursor.
    pub fn peek_u8(&self) -> Result<u8> {
        Ok(self.peek_bits(8)? as u8)
    }

    /// Appends a `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(value as u64, 16);
    }

    /// Reads a `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    /// Appends a `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value as u64, 32);
    }

    /// Reads a `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_bits(32)? as u32)
    }

    /// Reads a `u32` without moving the cursor.
    pub fn peek_u32(&self) -> Result<u32> {
        Ok(self.peek_bits(32)? as u32)
    }

    /// Appends a `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.write_bits(value, 64);
    }

    /// Reads a `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_bits(64)
    }

    /// Appends an `i8`.
    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    /// Reads an `i8`.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Appends an `i16`.
    pub fn write_i16(&mut self, value: i16) {
        self.write_u16(value as u16);
    }

    /// Reads an `i16`.
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Appends an `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    /// Reads an `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Appends an `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    /// Reads an `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Appends an `f32` by bit pattern.
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    /// Reads an `f32`.
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Appends an `f64` by bit pattern.
    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// Reads an `f64`.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Appends an unsigned integer that uses only `bits` bits on the wire.
    pub fn write_ranged(&mut self, value: u32, bits: u32) {
        debug_assert!(bits == 32 || value < (1 << bits));
        self.write_bits(value as u64, bits);
    }

    /// Appends a `u32` in 7-bit groups; small values take one byte.
    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    /// Reads a `u32` written by [`write_var_u32`](Self::write_var_u32).
    pub fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| DecodingErrorKind::VarInt.into())
    }

    /// Appends a `u64` in 7-bit groups.
    pub fn write_var_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.write_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.write_u8(value as u8);
    }

    /// Reads a `u64` written by [`write_var_u64`](Self::write_var_u64).
    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                return Err(DecodingErrorKind::VarInt.into());
            }
        }
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_length % 8 == 0 {
            let start = self.bit_length / 8;
            self.ensure_bit_capacity(self.bit_length + bytes.len() * 8);
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.bit_length += bytes.len() * 8;
        } else {
            for &byte in bytes {
                self.write_u8(byte);
            }
        }
    }

    /// Reads `out.len()` bytes into `out`.
    pub fn read_bytes_into(&mut self, out: &mut [u8]) -> Result<()> {
        self.check_remaining(out.len().saturating_mul(8))?;
        if self.read_position % 8 == 0 {
            let start = self.read_position / 8;
            out.copy_from_slice(&self.data[start..start + out.len()]);
            self.read_position += out.len() * 8;
        } else {
            for byte in out.iter_mut() {
                *byte = self.read_u8()?;
            }
        }
        Ok(())
    }

    /// Reads `count` bytes.
    ///
    /// Fails before allocating when fewer than `count` bytes remain.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.check_remaining(count.checked_mul(8).unwrap_or(usize::MAX))?;
        let mut out = vec![0; count];
        self.read_bytes_into(&mut out)?;
        Ok(out)
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_var_u32(value.len() as u32);
        self.write_bytes(value.as_bytes());
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| DecodingErrorKind::InvalidString.into())
    }

    /// Pads with zero bits up to the next byte boundary.
    pub fn write_padding(&mut self) {
        let pad = (8 - self.bit_length % 8) % 8;
        if pad > 0 {
            self.write_bits(0, pad as u32);
        }
    }

    /// Skips the read cursor to the next byte boundary.
    pub fn skip_padding(&mut self) {
        let pad = (8 - self.read_position % 8) % 8;
        self.read_position = (self.read_position + pad).min(self.bit_length);
    }

    /// Appends a value through its [`Encode`] schema.
    pub fn write_value<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Reads a value through its [`Decode`] schema.
    pub fn read_value<T: Decode>(&mut self) -> Result<T> {
        T::decode(self)
    }
}

impl std::fmt::Debug for BitBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitBuffer")
            .field("length_bits", &self.bit_length)
            .field("read_position", &self.read_position)
            .finish()
    }
}

macro_rules! primitive_schema {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, buffer: &mut BitBuffer) {
                    buffer.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(buffer: &mut BitBuffer) -> Result<Self> {
                    buffer.$read()
                }
            }
        )*
    };
}

primitive_schema! {
    bool => write_bool, read_bool;
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i8 => write_i8, read_i8;
    i16 => write_i16, read_i16;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
}

impl Encode for str {
    fn encode(&self, buffer: &mut BitBuffer) {
        buffer.write_string(self);
    }
}

impl Encode for String {
    fn encode(&self, buffer: &mut BitBuffer) {
        buffer.write_string(self);
    }
}

impl Decode for String {
    fn decode(buffer: &mut BitBuffer) -> Result<Self> {
        buffer.read_string()
    }
}

impl Encode for [u8] {
    fn encode(&self, buffer: &mut BitBuffer) {
        buffer.write_var_u32(self.len() as u32);
        buffer.write_bytes(self);
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, buffer: &mut BitBuffer) {
        self.as_slice().encode(buffer);
    }
}

impl Decode for Vec<u8> {
    fn decode(buffer: &mut BitBuffer) -> Result<Self> {
        let len = buffer.read_var_u32()? as usize;
        buffer.read_bytes(len)
    }
}
