// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware decode driver.
//!
//! A backend owns the actual decode engine instances and the surfaces they decode into. The
//! session only ever talks to it through [`DecoderBackend`], and every call is wrapped with
//! [`backend_call!`] so that failures carry the name of the failing operation and the place it
//! was issued from.

pub mod sim;

use thiserror::Error;

use crate::ChromaFormat;
use crate::Rect;
use crate::Resolution;
use crate::SurfaceFormat;
use crate::VideoCodec;

/// Raw status returned by driver calls.
pub type Status = i32;

pub const STATUS_INVALID_VALUE: Status = 1;
pub const STATUS_OUT_OF_MEMORY: Status = 2;
pub const STATUS_NOT_MAPPED: Status = 211;
pub const STATUS_INVALID_HANDLE: Status = 400;
pub const STATUS_UNKNOWN: Status = 999;

/// Error returned when a call into the driver or the parser fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} returned error {code} at {file}:{line}")]
pub struct BackendError {
    pub operation: &'static str,
    pub code: Status,
    pub file: &'static str,
    pub line: u32,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Evaluates a driver call returning `Result<T, Status>` and turns a failure into a
/// [`BackendError`] recording the call expression and its location.
#[macro_export]
macro_rules! backend_call {
    ($call:expr) => {
        ($call).map_err(|code| $crate::backend::BackendError {
            operation: stringify!($call),
            code,
            file: file!(),
            line: line!(),
        })
    };
}

/// Identifies a decoder instance created by a backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DecoderHandle(pub u64);

/// Decoding capabilities of the hardware for a given codec, chroma format and bit depth.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderCaps {
    pub supported: bool,
    /// Mask of supported [`SurfaceFormat`]s, see [`SurfaceFormat::mask_bit`].
    pub output_format_mask: u16,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Maximum number of 16x16 macroblocks in a frame.
    pub max_mb_count: u32,
    pub max_decode_surfaces: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DeinterlaceMode {
    #[default]
    Weave,
    Adaptive,
}

/// Parameters used to create a decoder instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCreateInfo {
    pub codec: VideoCodec,
    pub chroma_format: ChromaFormat,
    pub bit_depth_minus8: u8,
    pub surface_format: SurfaceFormat,
    pub deinterlace_mode: DeinterlaceMode,
    pub coded_resolution: Resolution,
    /// Largest coded resolution the instance can be reconfigured to.
    pub max_resolution: Resolution,
    pub num_decode_surfaces: u32,
    /// Number of surfaces that can be mapped at the same time.
    pub num_output_surfaces: u32,
    /// Source region of the coded frame.
    pub display_area: Rect,
    /// Size the source region is scaled to.
    pub target_resolution: Resolution,
}

/// Parameters used to reconfigure a decoder instance without recreating it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderReconfigureInfo {
    pub coded_resolution: Resolution,
    pub num_decode_surfaces: u32,
    pub display_area: Rect,
    pub target_resolution: Resolution,
}

/// Picture parameters for one decode operation, delivered in decode order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureParams {
    /// Index of the decode surface the picture is decoded into.
    pub picture_index: u32,
    pub intra_pic: bool,
    pub ref_pic: bool,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub second_field: bool,
    /// Number of bitstream bytes making up the picture.
    pub bitstream_len: usize,
}

/// A picture ready for display, delivered in display order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub picture_index: u32,
    pub progressive_frame: bool,
    pub top_field_first: bool,
    pub repeat_first_field: i32,
    pub timestamp: i64,
}

/// Parameters used to map a decoded surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcParams {
    pub progressive_frame: bool,
    pub top_field_first: bool,
    pub second_field: bool,
    /// Opaque stream the mapping and post-processing run on.
    pub output_stream: u64,
}

/// A decoded surface made readable by [`DecoderBackend::map_frame`].
#[derive(Debug)]
pub struct MappedSurface {
    /// Driver address of the mapping.
    pub address: u64,
    pub picture_index: u32,
    /// Distance in bytes between two rows of any plane.
    pub pitch: usize,
    /// Offset of the luma plane and of up to two chroma planes in `data`.
    pub plane_offsets: [usize; 3],
    pub data: Vec<u8>,
}

/// Driver-side operations needed to decode a stream.
///
/// Methods return the raw driver status on failure. Callers are expected to go through
/// [`backend_call!`].
pub trait DecoderBackend {
    fn decoder_caps(
        &mut self,
        codec: VideoCodec,
        chroma_format: ChromaFormat,
        bit_depth_minus8: u8,
    ) -> Result<DecoderCaps, Status>;

    fn create_decoder(&mut self, info: &DecoderCreateInfo) -> Result<DecoderHandle, Status>;

    fn reconfigure_decoder(
        &mut self,
        decoder: DecoderHandle,
        info: &DecoderReconfigureInfo,
    ) -> Result<(), Status>;

    fn destroy_decoder(&mut self, decoder: DecoderHandle) -> Result<(), Status>;

    /// Kicks off decoding of a picture. Does not wait for completion.
    fn decode_picture(
        &mut self,
        decoder: DecoderHandle,
        params: &PictureParams,
    ) -> Result<(), Status>;

    /// Maps the surface holding `picture_index`, waiting for its decoding to complete.
    fn map_frame(
        &mut self,
        decoder: DecoderHandle,
        picture_index: u32,
        params: &ProcParams,
    ) -> Result<MappedSurface, Status>;

    fn unmap_frame(&mut self, decoder: DecoderHandle, surface: MappedSurface) -> Result<(), Status>;
}

impl<T: DecoderBackend + ?Sized> DecoderBackend for &mut T {
    fn decoder_caps(
        &mut self,
        codec: VideoCodec,
        chroma_format: ChromaFormat,
        bit_depth_minus8: u8,
    ) -> Result<DecoderCaps, Status> {
        (**self).decoder_caps(codec, chroma_format, bit_depth_minus8)
    }

    fn create_decoder(&mut self, info: &DecoderCreateInfo) -> Result<DecoderHandle, Status> {
        (**self).create_decoder(info)
    }

    fn reconfigure_decoder(
        &mut self,
        decoder: DecoderHandle,
        info: &DecoderReconfigureInfo,
    ) -> Result<(), Status> {
        (**self).reconfigure_decoder(decoder, info)
    }

    fn destroy_decoder(&mut self, decoder: DecoderHandle) -> Result<(), Status> {
        (**self).destroy_decoder(decoder)
    }

    fn decode_picture(
        &mut self,
        decoder: DecoderHandle,
        params: &PictureParams,
    ) -> Result<(), Status> {
        (**self).decode_picture(decoder, params)
    }

    fn map_frame(
        &mut self,
        decoder: DecoderHandle,
        picture_index: u32,
        params: &ProcParams,
    ) -> Result<MappedSurface, Status> {
        (**self).map_frame(decoder, picture_index, params)
    }

    fn unmap_frame(&mut self, decoder: DecoderHandle, surface: MappedSurface) -> Result<(), Status> {
        (**self).unmap_frame(decoder, surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> Result<u32, Status> {
        Err(STATUS_OUT_OF_MEMORY)
    }

    #[test]
    fn backend_call_records_context() {
        let err = backend_call!(failing()).unwrap_err();

        assert_eq!(err.operation, "failing()");
        assert_eq!(err.code, STATUS_OUT_OF_MEMORY);
        assert!(err.file.ends_with("backend.rs"));
        assert!(err.line > 0);
        assert!(err.to_string().starts_with("failing() returned error 2 at "));
    }

    #[test]
    fn backend_call_passes_success_through() {
        let ok: Result<u32, Status> = Ok(3);
        assert_eq!(backend_call!(ok), Ok(3));
    }
}
