#![no_std]

use heapless::Vec;

pub const SLIP_END: u8 = 0xC0;
pub const SLIP_ESC: u8 = 0xDB;
pub const SLIP_ESC_END: u8 = 0xDC;
pub const SLIP_ESC_ESC: u8 = 0xDD;
/// Sent as `ESC CLEAR` ahead of every frame so a receiver that was left
/// mid-frame by a reset or cable glitch discards its partial buffer.
pub const SLIP_CLEAR: u8 = 0xDE;

/// Upper bound on a decoded frame, CRC byte included.
pub const MAX_FRAME_LEN: usize = 256;
/// Upper bound on encoded command arguments (tag + args + CRC must fit a frame).
pub const MAX_ARGS_LEN: usize = 253;
/// Upper bound on an encoded return payload (payload + CRC must fit a frame).
pub const MAX_RETURN_LEN: usize = 254;
/// Worst-case SLIP expansion of a frame: reset escape, both END markers, and
/// every payload byte escaped.
pub const MAX_SLIP_LEN: usize = 2 * MAX_FRAME_LEN + 4;

/// Tag reserved for the identification handshake. Every device answers it
/// with its device id as a `CStr`; all other tags are assigned by the
/// device's manifest.
pub const DEVICE_ID_TAG: u8 = 0;

/// First payload byte of a device-side error response.
pub const ERR_MARKER: u8 = 0xFF;
/// Device rejected the command frame on CRC grounds.
pub const DEV_ERR_CRC: u8 = 0x01;
/// Device did not recognize the command tag.
pub const DEV_ERR_DISPATCH: u8 = 0x02;

pub type Frame = Vec<u8, MAX_FRAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    BufferTooSmall,
    PayloadTooLarge,
    InteriorNul,
    InvalidEncoding,
    InvalidCrc,
    Truncated,
    Device(u8),
}

/// CRC-8, polynomial 0x07, initial value 0x00, MSB first, no final XOR.
///
/// Self-checking: appending `crc8(data)` to `data` yields a span whose CRC
/// is zero, which is how response frames are verified.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0x00;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// SLIP-encode `frame` into `out`, returning the encoded length.
///
/// Layout: `ESC CLEAR` reset escape, `END`, the payload with `END`/`ESC`
/// bytes escaped, `END`.
pub fn slip_encode(frame: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    let mut idx = 0;
    ensure_capacity(out, idx + 1)?;
    out[idx] = SLIP_ESC;
    out[idx + 1] = SLIP_CLEAR;
    idx += 2;

    ensure_capacity(out, idx)?;
    out[idx] = SLIP_END;
    idx += 1;

    for &byte in frame {
        match byte {
            SLIP_END => {
                ensure_capacity(out, idx + 1)?;
                out[idx] = SLIP_ESC;
                out[idx + 1] = SLIP_ESC_END;
                idx += 2;
            }
            SLIP_ESC => {
                ensure_capacity(out, idx + 1)?;
                out[idx] = SLIP_ESC;
                out[idx + 1] = SLIP_ESC_ESC;
                idx += 2;
            }
            _ => {
                ensure_capacity(out, idx)?;
                out[idx] = byte;
                idx += 1;
            }
        }
    }

    ensure_capacity(out, idx)?;
    out[idx] = SLIP_END;
    Ok(idx + 1)
}

fn ensure_capacity(out: &[u8], idx: usize) -> Result<(), Error> {
    if idx >= out.len() {
        Err(Error::BufferTooSmall)
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    Receiving,
    Escaped,
}

/// Push-style SLIP frame decoder.
///
/// Bytes outside a frame (boot chatter, single-character debug traces) are
/// discarded. Malformed input never surfaces as an error: invalid escapes
/// and oversized frames silently drop the partial buffer and the decoder
/// returns to idle. An `ESC CLEAR` arriving mid-frame therefore acts as the
/// peer's reset request.
pub struct SlipDecoder {
    state: DecodeState,
    buffer: Frame,
}

impl SlipDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecodeState::Idle,
            buffer: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.buffer.clear();
    }

    /// Consume one byte; returns a complete frame when one is delimited.
    /// Empty frames (back-to-back `END`) are not emitted.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecodeState::Idle => {
                if byte == SLIP_END {
                    self.buffer.clear();
                    self.state = DecodeState::Receiving;
                }
                None
            }
            DecodeState::Receiving => match byte {
                SLIP_END => {
                    self.state = DecodeState::Idle;
                    if self.buffer.is_empty() {
                        None
                    } else {
                        let frame = self.buffer.clone();
                        self.buffer.clear();
                        Some(frame)
                    }
                }
                SLIP_ESC => {
                    self.state = DecodeState::Escaped;
                    None
                }
                _ => {
                    if self.buffer.push(byte).is_err() {
                        self.reset();
                    }
                    None
                }
            },
            DecodeState::Escaped => {
                let decoded = match byte {
                    SLIP_ESC_END => SLIP_END,
                    SLIP_ESC_ESC => SLIP_ESC,
                    _ => {
                        // Invalid escape, including the CLEAR reset request.
                        self.reset();
                        return None;
                    }
                };
                self.state = DecodeState::Receiving;
                if self.buffer.push(decoded).is_err() {
                    self.reset();
                }
                None
            }
        }
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// The closed set of types a manifest parameter or return value may have.
/// A `None` return type on a tool descriptor stands for `void`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    I16,
    I32,
    CStr,
}

impl WireType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "i16" => Some(WireType::I16),
            "i32" => Some(WireType::I32),
            "CStr" => Some(WireType::CStr),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WireType::I16 => "i16",
            WireType::I32 => "i32",
            WireType::CStr => "CStr",
        }
    }
}

/// Accumulates encoded command arguments in declaration order, little-endian,
/// no delimiters, bounded by `MAX_ARGS_LEN`.
pub struct ArgEncoder {
    buf: Vec<u8, MAX_ARGS_LEN>,
}

impl ArgEncoder {
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), Error> {
        self.buf
            .extend_from_slice(&value.to_le_bytes())
            .map_err(|_| Error::PayloadTooLarge)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), Error> {
        self.buf
            .extend_from_slice(&value.to_le_bytes())
            .map_err(|_| Error::PayloadTooLarge)
    }

    /// UTF-8 bytes followed by a single NUL terminator. The string body must
    /// not itself contain NUL.
    pub fn write_cstr(&mut self, value: &str) -> Result<(), Error> {
        if value.as_bytes().contains(&0) {
            return Err(Error::InteriorNul);
        }
        self.buf
            .extend_from_slice(value.as_bytes())
            .map_err(|_| Error::PayloadTooLarge)?;
        self.buf.push(0).map_err(|_| Error::PayloadTooLarge)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for ArgEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks a decoded payload, reading values against a declared type list.
pub struct PayloadCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads up to the NUL terminator, which must exist within bounds.
    pub fn read_cstr(&mut self) -> Result<&'a str, Error> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::InvalidEncoding)?;
        let s = core::str::from_utf8(&rest[..nul]).map_err(|_| Error::InvalidEncoding)?;
        self.pos += nul + 1;
        Ok(s)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Declares the payload fully consumed; trailing bytes are an encoding
    /// error.
    pub fn finish(self) -> Result<(), Error> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(Error::InvalidEncoding)
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidEncoding);
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }
}

/// Compose a command frame `[tag] [args] [crc]` into `out`, returning its
/// length. Ready for `slip_encode`.
pub fn encode_command(tag: u8, args: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if args.len() > MAX_ARGS_LEN {
        return Err(Error::PayloadTooLarge);
    }
    let total = 1 + args.len() + 1;
    if out.len() < total {
        return Err(Error::BufferTooSmall);
    }
    out[0] = tag;
    out[1..1 + args.len()].copy_from_slice(args);
    out[total - 1] = crc8(&out[..total - 1]);
    Ok(total)
}

/// Split a received command frame into tag and argument bytes, verifying the
/// trailing CRC.
pub fn decode_command(frame: &[u8]) -> Result<(u8, &[u8]), Error> {
    if frame.len() < 2 {
        return Err(Error::Truncated);
    }
    let (body, crc) = frame.split_at(frame.len() - 1);
    if crc8(body) != crc[0] {
        return Err(Error::InvalidCrc);
    }
    Ok((body[0], &body[1..]))
}

/// Compose a response frame `[payload] [crc]` into `out`. A void response is
/// an empty payload, leaving a bare CRC byte.
pub fn encode_response(payload: &[u8], out: &mut [u8]) -> Result<usize, Error> {
    if payload.len() > MAX_RETURN_LEN {
        return Err(Error::PayloadTooLarge);
    }
    let total = payload.len() + 1;
    if out.len() < total {
        return Err(Error::BufferTooSmall);
    }
    out[..payload.len()].copy_from_slice(payload);
    out[total - 1] = crc8(payload);
    Ok(total)
}

/// Compose the device-side error frame `[0xFF] [code] [crc]`.
pub fn encode_error_response(code: u8, out: &mut [u8]) -> Result<usize, Error> {
    if out.len() < 3 {
        return Err(Error::BufferTooSmall);
    }
    out[0] = ERR_MARKER;
    out[1] = code;
    out[2] = crc8(&out[..2]);
    Ok(3)
}

/// Verify a response frame's CRC and strip it, surfacing device error frames
/// as `Error::Device`.
///
/// A one-byte frame is a void response: an empty payload whose CRC byte must
/// be `crc8([]) == 0`.
pub fn decode_response(frame: &[u8]) -> Result<&[u8], Error> {
    if frame.is_empty() {
        return Err(Error::Truncated);
    }
    let (payload, crc) = frame.split_at(frame.len() - 1);
    if crc8(payload) != crc[0] {
        return Err(Error::InvalidCrc);
    }
    if payload.len() == 2 && payload[0] == ERR_MARKER {
        return Err(Error::Device(payload[1]));
    }
    Ok(payload)
}
