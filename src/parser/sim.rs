// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A parser for a synthetic bitstream, used to exercise sessions without real streams.
//!
//! The synthetic bitstream is a sequence of little-endian records, each starting with a one byte
//! tag:
//!
//! * sequence header: codec, coded size, display area, chroma format, bit depth, minimum number
//!   of decode surfaces, frame rate and scan type,
//! * picture: the decode surface index to decode into,
//! * display: the decode surface index to display, with an optional timestamp.
//!
//! [`SimPacketBuilder`] produces such packets. [`SimParser`] behaves like a hardware parser: it
//! only reports sequence changes, holds back up to `max_display_delay` pictures before displaying
//! them, and flushes everything on end of stream.

use std::collections::VecDeque;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use bytes::Buf;
use bytes::BufMut;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DisplayInfo;
use crate::backend::PictureParams;
use crate::backend::Status;
use crate::backend::STATUS_INVALID_VALUE;
use crate::backend::STATUS_UNKNOWN;
use crate::format::FrameRate;
use crate::format::RawVideoFormat;
use crate::parser::BitstreamPacket;
use crate::parser::PacketFlags;
use crate::parser::ParserCallbacks;
use crate::parser::ParserParams;
use crate::parser::SequenceResponse;
use crate::parser::VideoParser;
use crate::ChromaFormat;
use crate::Rect;
use crate::Resolution;
use crate::VideoCodec;

const TAG_SEQUENCE: u8 = 0x01;
const TAG_PICTURE: u8 = 0x02;
const TAG_DISPLAY: u8 = 0x03;

const SEQUENCE_LEN: usize = 43;
const PICTURE_LEN: usize = 6;
const DISPLAY_LEN: usize = 13;

/// Returns a progressive 30 fps format covering the whole coded frame.
pub fn simple_format(
    codec: VideoCodec,
    coded: Resolution,
    chroma_format: ChromaFormat,
    bit_depth_minus8: u8,
    min_num_decode_surfaces: u32,
) -> RawVideoFormat {
    RawVideoFormat {
        codec,
        frame_rate: FrameRate {
            numerator: 30,
            denominator: 1,
        },
        progressive_sequence: true,
        bit_depth_luma_minus8: bit_depth_minus8,
        bit_depth_chroma_minus8: bit_depth_minus8,
        min_num_decode_surfaces,
        coded_width: coded.width,
        coded_height: coded.height,
        display_area: Rect::new(0, 0, coded.width as i32, coded.height as i32),
        chroma_format,
        ..Default::default()
    }
}

/// Builds packets of the synthetic bitstream.
#[derive(Clone, Debug, Default)]
pub struct SimPacketBuilder {
    data: Vec<u8>,
}

impl SimPacketBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn sequence(mut self, format: &RawVideoFormat) -> Self {
        let data = &mut self.data;
        data.put_u8(TAG_SEQUENCE);
        data.put_u32_le(format.codec as u32);
        data.put_u32_le(format.coded_width);
        data.put_u32_le(format.coded_height);
        data.put_i32_le(format.display_area.left);
        data.put_i32_le(format.display_area.top);
        data.put_i32_le(format.display_area.right);
        data.put_i32_le(format.display_area.bottom);
        data.put_u32_le(format.chroma_format as u32);
        data.put_u8(format.bit_depth_luma_minus8);
        data.put_u8(format.min_num_decode_surfaces.min(u8::MAX as u32) as u8);
        data.put_u32_le(format.frame_rate.numerator);
        data.put_u32_le(format.frame_rate.denominator);
        data.put_u8(format.progressive_sequence as u8);
        self
    }

    /// Adds a picture to decode into surface `picture_index`.
    pub fn picture(mut self, picture_index: u32, intra: bool) -> Self {
        self.data.put_u8(TAG_PICTURE);
        self.data.put_u32_le(picture_index);
        self.data.put_u8(intra as u8);
        self.data.put_u8(1);
        self
    }

    /// Makes surface `picture_index` ready for display. Without a `timestamp`, the timestamp of
    /// the packet is used.
    pub fn display(mut self, picture_index: u32, timestamp: Option<i64>) -> Self {
        self.data.put_u8(TAG_DISPLAY);
        self.data.put_u32_le(picture_index);
        self.data.put_u8(timestamp.is_some() as u8);
        self.data.put_i64_le(timestamp.unwrap_or(0));
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Debug, PartialEq)]
enum Record {
    Sequence(RawVideoFormat),
    Picture(PictureParams),
    Display {
        picture_index: u32,
        timestamp: Option<i64>,
    },
}

fn parse_records(mut payload: &[u8]) -> anyhow::Result<Vec<Record>> {
    let mut records = Vec::new();
    let bitstream_len = payload.len();

    while payload.has_remaining() {
        let tag = payload.get_u8();
        match tag {
            TAG_SEQUENCE => {
                ensure!(payload.remaining() >= SEQUENCE_LEN, "truncated sequence record");
                let codec = payload.get_u32_le();
                let codec = VideoCodec::n(codec).ok_or_else(|| anyhow!("invalid codec {}", codec))?;
                let coded_width = payload.get_u32_le();
                let coded_height = payload.get_u32_le();
                let display_area = Rect::new(
                    payload.get_i32_le(),
                    payload.get_i32_le(),
                    payload.get_i32_le(),
                    payload.get_i32_le(),
                );
                let chroma = payload.get_u32_le();
                let chroma_format = ChromaFormat::n(chroma)
                    .ok_or_else(|| anyhow!("invalid chroma format {}", chroma))?;
                let bit_depth_minus8 = payload.get_u8();
                let min_num_decode_surfaces = payload.get_u8() as u32;
                let frame_rate = FrameRate {
                    numerator: payload.get_u32_le(),
                    denominator: payload.get_u32_le(),
                };
                let progressive_sequence = payload.get_u8() != 0;

                records.push(Record::Sequence(RawVideoFormat {
                    codec,
                    frame_rate,
                    progressive_sequence,
                    bit_depth_luma_minus8: bit_depth_minus8,
                    bit_depth_chroma_minus8: bit_depth_minus8,
                    min_num_decode_surfaces,
                    coded_width,
                    coded_height,
                    display_area,
                    chroma_format,
                    ..Default::default()
                }));
            }
            TAG_PICTURE => {
                ensure!(payload.remaining() >= PICTURE_LEN, "truncated picture record");
                let picture_index = payload.get_u32_le();
                let intra_pic = payload.get_u8() != 0;
                let ref_pic = payload.get_u8() != 0;

                records.push(Record::Picture(PictureParams {
                    picture_index,
                    intra_pic,
                    ref_pic,
                    bitstream_len,
                    ..Default::default()
                }));
            }
            TAG_DISPLAY => {
                ensure!(payload.remaining() >= DISPLAY_LEN, "truncated display record");
                let picture_index = payload.get_u32_le();
                let has_timestamp = payload.get_u8() != 0;
                let timestamp = payload.get_i64_le();

                records.push(Record::Display {
                    picture_index,
                    timestamp: has_timestamp.then_some(timestamp),
                });
            }
            _ => bail!("unknown record tag {:#04x}", tag),
        }
    }

    Ok(records)
}

fn parse_error(operation: &'static str, code: Status) -> BackendError {
    BackendError {
        operation,
        code,
        file: file!(),
        line: line!(),
    }
}

/// A [`VideoParser`] for the synthetic bitstream.
pub struct SimParser {
    params: ParserParams,
    /// Number of decode surfaces, as last set by the sequence callback.
    max_decode_surfaces: u32,
    format: Option<RawVideoFormat>,
    pending_display: VecDeque<DisplayInfo>,
}

impl SimParser {
    pub fn max_decode_surfaces(&self) -> u32 {
        self.max_decode_surfaces
    }

    /// Number of pictures decoded but held back from display.
    pub fn num_pending_display(&self) -> usize {
        self.pending_display.len()
    }

    fn display(
        callbacks: &mut dyn ParserCallbacks,
        info: Option<&DisplayInfo>,
    ) -> BackendResult<()> {
        if callbacks.on_display(info) {
            Ok(())
        } else {
            Err(parse_error("display callback", STATUS_UNKNOWN))
        }
    }

    fn flush_display(&mut self, callbacks: &mut dyn ParserCallbacks) -> BackendResult<()> {
        while let Some(info) = self.pending_display.pop_front() {
            Self::display(callbacks, Some(&info))?;
        }
        Ok(())
    }
}

impl VideoParser for SimParser {
    fn new(params: &ParserParams) -> BackendResult<Self> {
        if params.max_decode_surfaces == 0 {
            return Err(parse_error("SimParser::new", STATUS_INVALID_VALUE));
        }

        Ok(Self {
            params: params.clone(),
            max_decode_surfaces: params.max_decode_surfaces,
            format: None,
            pending_display: VecDeque::new(),
        })
    }

    fn parse(
        &mut self,
        packet: &BitstreamPacket,
        callbacks: &mut dyn ParserCallbacks,
    ) -> BackendResult<()> {
        let records = parse_records(packet.payload).map_err(|e| {
            log::debug!("sim: malformed packet: {:#}", e);
            parse_error("parse_records", STATUS_INVALID_VALUE)
        })?;

        if packet.flags.contains(PacketFlags::DISCONTINUITY) {
            log::debug!("sim: discontinuity at timestamp {}", packet.timestamp);
        }

        let packet_timestamp = if packet.flags.contains(PacketFlags::TIMESTAMP) {
            packet.timestamp
        } else {
            0
        };

        for record in records {
            match record {
                Record::Sequence(format) => {
                    if self.format.as_ref() == Some(&format) {
                        continue;
                    }
                    if format.codec != self.params.codec {
                        log::debug!(
                            "sim: stream codec {:?} does not match parser codec {:?}",
                            format.codec,
                            self.params.codec
                        );
                        return Err(parse_error("sequence header", STATUS_INVALID_VALUE));
                    }

                    // Pictures of the previous sequence are displayed before the new one starts.
                    self.flush_display(callbacks)?;

                    match callbacks.on_sequence(&format) {
                        SequenceResponse::Reject => {
                            return Err(parse_error("sequence callback", STATUS_UNKNOWN))
                        }
                        SequenceResponse::Accept => (),
                        SequenceResponse::PoolSize(n) => self.max_decode_surfaces = n,
                    }
                    self.format = Some(format);
                }
                Record::Picture(params) => {
                    if self.format.is_none() {
                        log::debug!("sim: skipping picture before the first sequence header");
                        continue;
                    }
                    if params.picture_index >= self.max_decode_surfaces {
                        return Err(parse_error("picture record", STATUS_INVALID_VALUE));
                    }
                    if !callbacks.on_decode(&params) {
                        return Err(parse_error("decode callback", STATUS_UNKNOWN));
                    }
                }
                Record::Display {
                    picture_index,
                    timestamp,
                } => {
                    let Some(format) = &self.format else {
                        continue;
                    };

                    self.pending_display.push_back(DisplayInfo {
                        picture_index,
                        progressive_frame: format.progressive_sequence,
                        top_field_first: false,
                        repeat_first_field: 0,
                        timestamp: timestamp.unwrap_or(packet_timestamp),
                    });
                    while self.pending_display.len() > self.params.max_display_delay as usize {
                        if let Some(info) = self.pending_display.pop_front() {
                            Self::display(callbacks, Some(&info))?;
                        }
                    }
                }
            }
        }

        if packet.flags.contains(PacketFlags::END_OF_STREAM) {
            self.flush_display(callbacks)?;
            if packet.flags.contains(PacketFlags::NOTIFY_EOS) {
                Self::display(callbacks, None)?;
            }
        }

        Ok(())
    }
}
