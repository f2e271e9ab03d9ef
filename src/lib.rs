// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session controller for callback-driven hardware video decoders.
//!
//! The hardware parser calls back into this crate, synchronously and from inside the parse call,
//! whenever the stream format changes, a picture is ready to be decoded, or a picture is ready to
//! be displayed. A [`session::Session`] turns that inverted control flow into a pull-based API:
//! bitstream goes in through [`session::Session::decode`], and decoded frames come out as
//! [`frame_ring::FrameLease`]s that must be handed back once the caller is done with them.
//!
//! The parser and the decode driver are reached through the [`parser::VideoParser`] and
//! [`backend::DecoderBackend`] traits. Simulated implementations of both live in
//! [`parser::sim`] and [`backend::sim`].

pub mod backend;
pub mod format;
pub mod frame_ring;
pub mod image_processing;
pub mod parser;
pub mod provisioner;
pub mod reconfig;
pub mod session;
pub mod tracker;

use std::str::FromStr;

use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` is large enough to hold a frame of size `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns the component-wise maximum of `self` and `other`.
    pub fn max(self, other: Self) -> Self {
        Self {
            width: self.width.max(other.width),
            height: self.height.max(other.height),
        }
    }

    /// Rounds both dimensions down to an even number, as required by chroma subsampling.
    pub fn even(self) -> Self {
        Self {
            width: self.width & !1,
            height: self.height & !1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// A rectangle in pixels. `right` and `bottom` are exclusive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> u32 {
        Self::extent(self.left, self.right)
    }

    pub fn height(&self) -> u32 {
        Self::extent(self.top, self.bottom)
    }

    fn extent(start: i32, end: i32) -> u32 {
        (end as i64 - start as i64).clamp(0, u32::MAX as i64) as u32
    }

    pub fn size(&self) -> Resolution {
        Resolution::from((self.width(), self.height()))
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Whether the rectangle lies entirely inside a frame of size `bounds`.
    pub fn fits_in(&self, bounds: Resolution) -> bool {
        self.left >= 0
            && self.top >= 0
            && self.right <= bounds.width as i32
            && self.bottom <= bounds.height as i32
    }
}

/// Compression formats understood by the hardware parser. The discriminants match the values
/// used by the driver interface.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VideoCodec {
    Mpeg1 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    Vc1 = 3,
    #[default]
    H264 = 4,
    Jpeg = 5,
    H264Svc = 6,
    H264Mvc = 7,
    Hevc = 8,
    Vp8 = 9,
    Vp9 = 10,
    Av1 = 11,
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::Mpeg1 => "MPEG-1",
            VideoCodec::Mpeg2 => "MPEG-2",
            VideoCodec::Mpeg4 => "MPEG-4 (ASP)",
            VideoCodec::Vc1 => "VC-1/WMV",
            VideoCodec::H264 => "AVC/H.264",
            VideoCodec::Jpeg => "M-JPEG",
            VideoCodec::H264Svc => "H.264/SVC",
            VideoCodec::H264Mvc => "H.264/MVC",
            VideoCodec::Hevc => "H.265/HEVC",
            VideoCodec::Vp8 => "VP8",
            VideoCodec::Vp9 => "VP9",
            VideoCodec::Av1 => "AV1",
        }
    }
}

/// Returns a human-readable name for the raw driver codec value `codec`.
pub fn codec_name(codec: u32) -> &'static str {
    VideoCodec::n(codec).map_or("Unknown", |c| c.name())
}

impl FromStr for VideoCodec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg1" | "MPEG1" => Ok(VideoCodec::Mpeg1),
            "mpeg2" | "MPEG2" => Ok(VideoCodec::Mpeg2),
            "mpeg4" | "MPEG4" => Ok(VideoCodec::Mpeg4),
            "vc1" | "VC1" => Ok(VideoCodec::Vc1),
            "h264" | "H264" => Ok(VideoCodec::H264),
            "mjpeg" | "MJPEG" => Ok(VideoCodec::Jpeg),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(VideoCodec::Hevc),
            "vp8" | "VP8" => Ok(VideoCodec::Vp8),
            "vp9" | "VP9" => Ok(VideoCodec::Vp9),
            "av1" | "AV1" => Ok(VideoCodec::Av1),
            _ => Err("unrecognized codec. Valid values: mpeg1, mpeg2, mpeg4, vc1, h264, mjpeg, h265, vp8, vp9, av1"),
        }
    }
}

/// Chroma subsampling of the decoded stream.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

impl ChromaFormat {
    pub fn name(&self) -> &'static str {
        match self {
            ChromaFormat::Monochrome => "YUV 400 (Monochrome)",
            ChromaFormat::Yuv420 => "YUV 420",
            ChromaFormat::Yuv422 => "YUV 422",
            ChromaFormat::Yuv444 => "YUV 444",
        }
    }

    /// Height of a chroma plane relative to the luma plane.
    pub fn height_factor(&self) -> f32 {
        match self {
            ChromaFormat::Monochrome => 0.0,
            ChromaFormat::Yuv420 => 0.5,
            ChromaFormat::Yuv422 | ChromaFormat::Yuv444 => 1.0,
        }
    }

    /// Number of chroma planes in the decoded surface. 4:2:0 and 4:2:2 surfaces carry both
    /// chroma components interleaved in a single plane.
    pub fn plane_count(&self) -> u32 {
        match self {
            ChromaFormat::Monochrome => 0,
            ChromaFormat::Yuv420 | ChromaFormat::Yuv422 => 1,
            ChromaFormat::Yuv444 => 2,
        }
    }
}

/// Returns a human-readable name for the raw driver chroma format value `chroma`.
pub fn chroma_name(chroma: u32) -> &'static str {
    ChromaFormat::n(chroma).map_or("Unknown", |c| c.name())
}

/// Memory layout of the surfaces the hardware decodes into.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SurfaceFormat {
    #[default]
    Nv12 = 0,
    P016 = 1,
    Yuv444 = 2,
    Yuv444_16Bit = 3,
}

impl SurfaceFormat {
    /// Bit used for this format in [`backend::DecoderCaps::output_format_mask`].
    pub fn mask_bit(&self) -> u16 {
        1 << (*self as u32)
    }

    pub fn is_high_bit_depth(&self) -> bool {
        matches!(self, SurfaceFormat::P016 | SurfaceFormat::Yuv444_16Bit)
    }
}

/// Layout of the frames handed out to the client.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Same plane arrangement as the decode surface, with the padding removed.
    #[default]
    SemiPlanar,
    /// Interleaved chroma is split into separate U and V planes.
    Planar,
}

impl FromStr for OutputFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semiplanar" | "nv12" | "NV12" => Ok(OutputFormat::SemiPlanar),
            "planar" | "i420" | "I420" => Ok(OutputFormat::Planar),
            _ => Err("unrecognized output format. Valid values: semiplanar (nv12), planar (i420)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names() {
        assert_eq!(codec_name(4), "AVC/H.264");
        assert_eq!(codec_name(8), "H.265/HEVC");
        assert_eq!(codec_name(11), "AV1");
        assert_eq!(codec_name(200), "Unknown");
        assert_eq!("hevc".parse::<VideoCodec>(), Ok(VideoCodec::Hevc));
        assert!("h266".parse::<VideoCodec>().is_err());
    }

    #[test]
    fn chroma_properties() {
        assert_eq!(chroma_name(0), "YUV 400 (Monochrome)");
        assert_eq!(chroma_name(9), "Unknown");

        let factors: Vec<f32> = [
            ChromaFormat::Monochrome,
            ChromaFormat::Yuv420,
            ChromaFormat::Yuv422,
            ChromaFormat::Yuv444,
        ]
        .iter()
        .map(|c| c.height_factor())
        .collect();
        assert_eq!(factors, vec![0.0, 0.5, 1.0, 1.0]);

        assert_eq!(ChromaFormat::Monochrome.plane_count(), 0);
        assert_eq!(ChromaFormat::Yuv420.plane_count(), 1);
        assert_eq!(ChromaFormat::Yuv422.plane_count(), 1);
        assert_eq!(ChromaFormat::Yuv444.plane_count(), 2);
    }

    #[test]
    fn rect_geometry() {
        let rect = Rect::new(8, 4, 648, 364);
        assert_eq!(rect.size(), Resolution::from((640, 360)));
        assert!(rect.fits_in(Resolution::from((656, 368))));
        assert!(!rect.fits_in(Resolution::from((640, 360))));
        assert!(Rect::new(10, 10, 5, 20).is_empty());
        assert_eq!(Resolution::from((641, 361)).even(), Resolution::from((640, 360)));
    }

    #[test]
    fn rect_extents_saturate() {
        assert_eq!(Rect::new(i32::MIN, 0, 10, 10).width(), 2_147_483_658);
        assert_eq!(Rect::new(i32::MIN, 0, i32::MAX, 10).width(), u32::MAX);
        assert_eq!(Rect::new(0, i32::MAX, 10, i32::MIN).height(), 0);
        assert!(Rect::new(0, i32::MAX, 10, i32::MIN).is_empty());
    }
}
