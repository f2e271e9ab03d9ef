// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stream format as reported by the parser, and the output geometry derived from it.

use std::fmt::Write;

use crate::backend::DecoderCaps;
use crate::reconfig::ReconfigParams;
use crate::session::DecodeError;
use crate::ChromaFormat;
use crate::Rect;
use crate::Resolution;
use crate::SurfaceFormat;
use crate::VideoCodec;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    /// Frames per second, or 0 if the rate is unspecified.
    pub fn fps(&self) -> f64 {
        if self.denominator == 0 {
            0.0
        } else {
            self.numerator as f64 / self.denominator as f64
        }
    }
}

/// VUI video signal description, see section E.2.1 of the H.264 specification.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoSignalDescription {
    pub video_format: u8,
    pub full_range: bool,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

/// Format record delivered by the parser's sequence callback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawVideoFormat {
    pub codec: VideoCodec,
    pub frame_rate: FrameRate,
    pub progressive_sequence: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    /// Minimum number of decode surfaces required to decode this stream correctly.
    pub min_num_decode_surfaces: u32,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Area of the coded frame that should be displayed.
    pub display_area: Rect,
    pub chroma_format: ChromaFormat,
    /// Bitrate in bits per second, 0 if unknown.
    pub bitrate: u32,
    pub display_aspect_ratio: (i32, i32),
    pub video_signal_description: VideoSignalDescription,
}

impl RawVideoFormat {
    pub fn coded_resolution(&self) -> Resolution {
        Resolution::from((self.coded_width, self.coded_height))
    }
}

/// Picks the surface format the hardware should decode into, falling back to whatever `caps`
/// supports if the natural choice for the stream isn't available.
pub fn choose_surface_format(
    format: &RawVideoFormat,
    caps: &DecoderCaps,
) -> Result<SurfaceFormat, DecodeError> {
    let high_bit_depth = format.bit_depth_luma_minus8 > 0;
    let preferred = match (format.chroma_format, high_bit_depth) {
        (ChromaFormat::Yuv444, false) => SurfaceFormat::Yuv444,
        (ChromaFormat::Yuv444, true) => SurfaceFormat::Yuv444_16Bit,
        (_, false) => SurfaceFormat::Nv12,
        (_, true) => SurfaceFormat::P016,
    };

    if caps.output_format_mask & preferred.mask_bit() != 0 {
        return Ok(preferred);
    }

    [
        SurfaceFormat::Nv12,
        SurfaceFormat::P016,
        SurfaceFormat::Yuv444,
        SurfaceFormat::Yuv444_16Bit,
    ]
    .into_iter()
    .find(|f| caps.output_format_mask & f.mask_bit() != 0)
    .ok_or_else(|| {
        DecodeError::Unsupported(format!(
            "no output surface format available for {} at {} bits",
            format.chroma_format.name(),
            format.bit_depth_luma_minus8 + 8
        ))
    })
}

/// Immutable snapshot of the active stream geometry.
///
/// Created from the sequence callback's [`RawVideoFormat`] and the current
/// [`ReconfigParams`]. All surface and output buffer sizing derives from it.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFormatDescriptor {
    raw: RawVideoFormat,
    surface_format: SurfaceFormat,
    /// Region of the coded frame the hardware reads from.
    display_area: Rect,
    /// Size of the decode surfaces the hardware writes to.
    surface_resolution: Resolution,
    /// Position of the output region inside a decode surface.
    surface_offset: (u32, u32),
    /// Region of the coded frame the hardware scales into the decode surfaces.
    decode_area: Rect,
    width: u32,
    luma_height: u32,
    chroma_height: u32,
    num_chroma_planes: u32,
    bytes_per_pixel: u32,
}

impl VideoFormatDescriptor {
    pub fn new(raw: &RawVideoFormat, surface_format: SurfaceFormat, params: &ReconfigParams) -> Self {
        let display_area = params.crop.unwrap_or(raw.display_area);
        let output = match (params.crop, params.resize) {
            (_, Some(resize)) => resize,
            (Some(crop), None) => crop.size(),
            (None, None) => raw.display_area.size(),
        }
        .even();

        // Without post-processing the hardware decodes at coded size and we read the visible
        // region out of it.
        let coded = raw.coded_resolution();
        let (surface_resolution, surface_offset, decode_area) = if params.is_empty() {
            let left = display_area.left.max(0) as u32 & !1;
            let top = display_area.top.max(0) as u32 & !1;
            let full_frame = Rect::new(0, 0, coded.width as i32, coded.height as i32);
            (coded, (left, top), full_frame)
        } else {
            (output, (0, 0), display_area)
        };

        let chroma_height =
            (output.height as f32 * raw.chroma_format.height_factor()).ceil() as u32;
        let bytes_per_pixel = if raw.bit_depth_luma_minus8 > 0 { 2 } else { 1 };

        Self {
            raw: raw.clone(),
            surface_format,
            display_area,
            surface_resolution,
            surface_offset,
            decode_area,
            width: output.width,
            luma_height: output.height,
            chroma_height,
            num_chroma_planes: raw.chroma_format.plane_count(),
            bytes_per_pixel,
        }
    }

    pub fn raw(&self) -> &RawVideoFormat {
        &self.raw
    }

    pub fn codec(&self) -> VideoCodec {
        self.raw.codec
    }

    pub fn chroma_format(&self) -> ChromaFormat {
        self.raw.chroma_format
    }

    pub fn bit_depth_minus8(&self) -> u8 {
        self.raw.bit_depth_luma_minus8
    }

    pub fn bit_depth(&self) -> u32 {
        self.raw.bit_depth_luma_minus8 as u32 + 8
    }

    pub fn coded_resolution(&self) -> Resolution {
        self.raw.coded_resolution()
    }

    pub fn display_area(&self) -> Rect {
        self.display_area
    }

    pub fn surface_format(&self) -> SurfaceFormat {
        self.surface_format
    }

    pub fn surface_resolution(&self) -> Resolution {
        self.surface_resolution
    }

    pub fn decode_area(&self) -> Rect {
        self.decode_area
    }

    /// Column and row of the first output pixel inside a decode surface.
    pub fn surface_offset(&self) -> (u32, u32) {
        self.surface_offset
    }

    /// Height of each chroma plane inside a decode surface.
    pub fn surface_chroma_height(&self) -> u32 {
        (self.surface_resolution.height as f32 * self.raw.chroma_format.height_factor()).ceil()
            as u32
    }

    /// Output width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn luma_height(&self) -> u32 {
        self.luma_height
    }

    pub fn chroma_height(&self) -> u32 {
        self.chroma_height
    }

    pub fn num_chroma_planes(&self) -> u32 {
        self.num_chroma_planes
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    pub fn output_resolution(&self) -> Resolution {
        Resolution::from((self.width, self.luma_height))
    }

    /// Size in bytes of one output row of any plane.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.bytes_per_pixel as usize
    }

    /// Size in bytes of one output frame, without padding.
    pub fn frame_size(&self) -> usize {
        self.row_bytes()
            * (self.luma_height as usize + self.chroma_height as usize * self.num_chroma_planes as usize)
    }

    /// Human readable description of the stream and of the decoding parameters.
    pub fn video_info(&self, num_decode_surfaces: u32) -> String {
        let raw = &self.raw;
        let mut info = String::new();

        // Writing into a `String` cannot fail.
        let _ = writeln!(info, "Video input information");
        let _ = writeln!(info, "\tCodec        : {}", raw.codec.name());
        let _ = writeln!(
            info,
            "\tFrame rate   : {}/{} = {:.2} fps",
            raw.frame_rate.numerator,
            raw.frame_rate.denominator,
            raw.frame_rate.fps()
        );
        let _ = writeln!(
            info,
            "\tSequence     : {}",
            if raw.progressive_sequence {
                "Progressive"
            } else {
                "Interlaced"
            }
        );
        let _ = writeln!(
            info,
            "\tCoded size   : [{}, {}]",
            raw.coded_width, raw.coded_height
        );
        let _ = writeln!(
            info,
            "\tDisplay area : [{}, {}, {}, {}]",
            raw.display_area.left, raw.display_area.top, raw.display_area.right, raw.display_area.bottom
        );
        let _ = writeln!(info, "\tChroma       : {}", raw.chroma_format.name());
        let _ = writeln!(info, "\tBit depth    : {}", self.bit_depth());
        let _ = writeln!(info, "Video decoding parameters");
        let _ = writeln!(info, "\tNum surfaces : {}", num_decode_surfaces);
        let _ = writeln!(info, "\tSurface      : {:?}", self.surface_format);
        let _ = writeln!(
            info,
            "\tCrop         : [{}, {}, {}, {}]",
            self.display_area.left, self.display_area.top, self.display_area.right, self.display_area.bottom
        );
        let _ = writeln!(info, "\tOutput size  : {}x{}", self.width, self.luma_height);
        let _ = write!(info, "\tFrame size   : {} bytes", self.frame_size());

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_1080p(chroma: ChromaFormat, bit_depth_minus8: u8) -> RawVideoFormat {
        RawVideoFormat {
            codec: VideoCodec::H264,
            frame_rate: FrameRate {
                numerator: 30000,
                denominator: 1001,
            },
            progressive_sequence: true,
            bit_depth_luma_minus8: bit_depth_minus8,
            bit_depth_chroma_minus8: bit_depth_minus8,
            min_num_decode_surfaces: 8,
            coded_width: 1920,
            coded_height: 1088,
            display_area: Rect::new(0, 0, 1920, 1080),
            chroma_format: chroma,
            ..Default::default()
        }
    }

    fn all_formats_caps() -> DecoderCaps {
        DecoderCaps {
            output_format_mask: 0xf,
            ..Default::default()
        }
    }

    #[test]
    fn derived_geometry_420() {
        let raw = raw_1080p(ChromaFormat::Yuv420, 0);
        let desc = VideoFormatDescriptor::new(&raw, SurfaceFormat::Nv12, &Default::default());

        assert_eq!(desc.width(), 1920);
        assert_eq!(desc.luma_height(), 1080);
        assert_eq!(desc.chroma_height(), 540);
        assert_eq!(desc.num_chroma_planes(), 1);
        assert_eq!(desc.bytes_per_pixel(), 1);
        assert_eq!(desc.surface_resolution(), Resolution::from((1920, 1088)));
        assert_eq!(desc.surface_chroma_height(), 544);
        assert_eq!(desc.surface_offset(), (0, 0));
        assert_eq!(desc.decode_area(), Rect::new(0, 0, 1920, 1088));
        assert_eq!(desc.frame_size(), 1920 * (1080 + 540));
    }

    #[test]
    fn derived_geometry_other_chroma_formats() {
        let mono = VideoFormatDescriptor::new(
            &raw_1080p(ChromaFormat::Monochrome, 0),
            SurfaceFormat::Nv12,
            &Default::default(),
        );
        assert_eq!(mono.chroma_height(), 0);
        assert_eq!(mono.frame_size(), 1920 * 1080);

        let yuv444_10 = VideoFormatDescriptor::new(
            &raw_1080p(ChromaFormat::Yuv444, 2),
            SurfaceFormat::Yuv444_16Bit,
            &Default::default(),
        );
        assert_eq!(yuv444_10.bit_depth(), 10);
        assert_eq!(yuv444_10.bytes_per_pixel(), 2);
        assert_eq!(yuv444_10.frame_size(), 1920 * 2 * (1080 + 1080 * 2));
    }

    #[test]
    fn crop_and_resize_define_output() {
        let raw = raw_1080p(ChromaFormat::Yuv420, 0);

        let cropped = VideoFormatDescriptor::new(
            &raw,
            SurfaceFormat::Nv12,
            &ReconfigParams {
                crop: Some(Rect::new(100, 50, 741, 411)),
                resize: None,
            },
        );
        assert_eq!(cropped.output_resolution(), Resolution::from((640, 360)));
        assert_eq!(cropped.surface_resolution(), Resolution::from((640, 360)));
        assert_eq!(cropped.display_area(), Rect::new(100, 50, 741, 411));
        assert_eq!(cropped.surface_offset(), (0, 0));
        assert_eq!(cropped.decode_area(), Rect::new(100, 50, 741, 411));

        let resized = VideoFormatDescriptor::new(
            &raw,
            SurfaceFormat::Nv12,
            &ReconfigParams {
                crop: None,
                resize: Some(Resolution::from((1280, 720))),
            },
        );
        assert_eq!(resized.output_resolution(), Resolution::from((1280, 720)));
        assert_eq!(resized.display_area(), raw.display_area);
        assert_eq!(resized.chroma_height(), 360);
    }

    #[test]
    fn display_area_offset_is_read_from_coded_surface() {
        let mut raw = raw_1080p(ChromaFormat::Yuv420, 0);
        raw.display_area = Rect::new(9, 4, 1289, 724);
        let desc = VideoFormatDescriptor::new(&raw, SurfaceFormat::Nv12, &Default::default());

        assert_eq!(desc.surface_resolution(), Resolution::from((1920, 1088)));
        assert_eq!(desc.surface_offset(), (8, 4));
        assert_eq!(desc.output_resolution(), Resolution::from((1280, 720)));
    }

    #[test]
    fn surface_format_selection() {
        let caps = all_formats_caps();
        let pick = |chroma, depth| choose_surface_format(&raw_1080p(chroma, depth), &caps).unwrap();

        assert_eq!(pick(ChromaFormat::Yuv420, 0), SurfaceFormat::Nv12);
        assert_eq!(pick(ChromaFormat::Yuv420, 2), SurfaceFormat::P016);
        assert_eq!(pick(ChromaFormat::Monochrome, 0), SurfaceFormat::Nv12);
        assert_eq!(pick(ChromaFormat::Yuv444, 0), SurfaceFormat::Yuv444);
        assert_eq!(pick(ChromaFormat::Yuv444, 4), SurfaceFormat::Yuv444_16Bit);

        let nv12_only = DecoderCaps {
            output_format_mask: SurfaceFormat::Nv12.mask_bit(),
            ..Default::default()
        };
        assert_eq!(
            choose_surface_format(&raw_1080p(ChromaFormat::Yuv420, 2), &nv12_only).unwrap(),
            SurfaceFormat::Nv12
        );

        let nothing = DecoderCaps::default();
        assert!(matches!(
            choose_surface_format(&raw_1080p(ChromaFormat::Yuv420, 0), &nothing),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn video_info_mentions_stream_properties() {
        let raw = raw_1080p(ChromaFormat::Yuv420, 0);
        let desc = VideoFormatDescriptor::new(&raw, SurfaceFormat::Nv12, &Default::default());
        let info = desc.video_info(8);

        assert!(info.contains("AVC/H.264"));
        assert!(info.contains("29.97 fps"));
        assert!(info.contains("[1920, 1088]"));
        assert!(info.contains("YUV 420"));
        assert!(info.contains("Num surfaces : 8"));
    }
}
