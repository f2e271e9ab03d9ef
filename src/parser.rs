// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the bitstream parser that drives decoding.
//!
//! The parser is handed bitstream packets and, synchronously from within
//! [`VideoParser::parse`], calls back into the [`ParserCallbacks`] it is given whenever the
//! sequence format changes, a picture is ready to be decoded, or a picture is ready to be
//! displayed. Callbacks run on the caller's stack and may be invoked any number of times per
//! packet.

pub mod sim;

use std::ops::BitOr;
use std::ops::BitOrAssign;

use crate::backend::BackendResult;
use crate::backend::DisplayInfo;
use crate::backend::PictureParams;
use crate::format::RawVideoFormat;
use crate::VideoCodec;

/// Flags attached to a [`BitstreamPacket`]. The bit values are those of the driver interface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub const NONE: Self = Self(0);
    /// Last packet of the stream. Pending pictures are flushed.
    pub const END_OF_STREAM: Self = Self(0x01);
    /// The packet timestamp is valid.
    pub const TIMESTAMP: Self = Self(0x02);
    /// Signals a discontinuity in the stream.
    pub const DISCONTINUITY: Self = Self(0x04);
    /// The packet contains exactly one frame or one field.
    pub const END_OF_PICTURE: Self = Self(0x08);
    /// Together with `END_OF_STREAM`, requests an empty display callback once the stream has
    /// been flushed.
    pub const NOTIFY_EOS: Self = Self(0x10);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x1f)
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PacketFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

/// A chunk of elementary stream handed to the parser.
#[derive(Clone, Debug)]
pub struct BitstreamPacket<'a> {
    pub payload: &'a [u8],
    /// Presentation timestamp, valid if `flags` contains [`PacketFlags::TIMESTAMP`].
    pub timestamp: i64,
    pub flags: PacketFlags,
}

/// Answer of the sequence callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SequenceResponse {
    /// The format cannot be decoded. Parsing fails.
    Reject,
    Accept,
    /// Accepted, and the parser must cycle through this many decode surfaces from now on.
    PoolSize(u32),
}

impl SequenceResponse {
    /// Value returned to the driver: 0 for failure, 1 for success, or the decode surface count.
    pub fn as_raw(&self) -> i32 {
        match self {
            SequenceResponse::Reject => 0,
            SequenceResponse::Accept => 1,
            SequenceResponse::PoolSize(n) => *n as i32,
        }
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            i32::MIN..=0 => SequenceResponse::Reject,
            1 => SequenceResponse::Accept,
            n => SequenceResponse::PoolSize(n as u32),
        }
    }
}

/// Handlers the parser calls into while parsing.
pub trait ParserCallbacks {
    /// Called before the first picture and whenever the stream format changes.
    fn on_sequence(&mut self, format: &RawVideoFormat) -> SequenceResponse;

    /// Called, in decode order, when a picture is ready to be decoded. Returning `false` fails
    /// the parse call.
    fn on_decode(&mut self, params: &PictureParams) -> bool;

    /// Called, in display order, when a picture is ready to be displayed. `None` signals the
    /// end of the stream. Returning `false` fails the parse call.
    fn on_display(&mut self, info: Option<&DisplayInfo>) -> bool;
}

/// Parameters the parser is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParserParams {
    pub codec: VideoCodec,
    /// Number of decode surfaces the parser cycles through until the sequence callback
    /// overrides it.
    pub max_decode_surfaces: u32,
    /// Timestamp units in Hz.
    pub clock_rate: u32,
    /// Percentage of corrupted bitstream above which pictures are not decoded.
    pub error_threshold: u32,
    /// Number of pictures the parser may hold back before displaying them.
    pub max_display_delay: u32,
}

/// A bitstream parser driving decode through callbacks.
pub trait VideoParser {
    fn new(params: &ParserParams) -> BackendResult<Self>
    where
        Self: Sized;

    /// Parses `packet`, invoking `callbacks` synchronously as needed.
    fn parse(
        &mut self,
        packet: &BitstreamPacket,
        callbacks: &mut dyn ParserCallbacks,
    ) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let mut flags = PacketFlags::END_OF_STREAM | PacketFlags::NOTIFY_EOS;
        assert_eq!(flags.bits(), 0x11);
        assert!(flags.contains(PacketFlags::END_OF_STREAM));
        assert!(!flags.contains(PacketFlags::TIMESTAMP));

        flags |= PacketFlags::TIMESTAMP;
        assert!(flags.contains(PacketFlags::TIMESTAMP | PacketFlags::NOTIFY_EOS));
        assert_eq!(PacketFlags::from_bits(0xff).bits(), 0x1f);
    }

    #[test]
    fn sequence_response_raw_values() {
        assert_eq!(SequenceResponse::Reject.as_raw(), 0);
        assert_eq!(SequenceResponse::Accept.as_raw(), 1);
        assert_eq!(SequenceResponse::PoolSize(9).as_raw(), 9);
        assert_eq!(SequenceResponse::from_raw(0), SequenceResponse::Reject);
        assert_eq!(SequenceResponse::from_raw(1), SequenceResponse::Accept);
        assert_eq!(SequenceResponse::from_raw(12), SequenceResponse::PoolSize(12));
    }
}
