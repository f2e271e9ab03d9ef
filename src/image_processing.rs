// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Copies decoded surfaces into output frames.
//!
//! Output frames contain the luma plane followed by the chroma planes, each plane made of rows
//! `pitch` bytes apart. Only the first `width * bytes_per_pixel` bytes of each row are
//! meaningful.

use anyhow::ensure;

use crate::backend::MappedSurface;
use crate::format::VideoFormatDescriptor;
use crate::ChromaFormat;
use crate::OutputFormat;

/// Turns a mapped decode surface into an output frame.
pub trait PostProcessor: Send {
    /// Fills `dst`, whose rows are `dst_pitch` bytes apart, from the mapped surface `src`
    /// decoded with geometry `format`.
    fn process(
        &mut self,
        src: &MappedSurface,
        dst: &mut [u8],
        dst_pitch: usize,
        format: &VideoFormatDescriptor,
    ) -> anyhow::Result<()>;
}

/// Size of an output frame of `format` whose rows are `pitch` bytes apart.
pub fn output_frame_size(format: &VideoFormatDescriptor, pitch: usize) -> usize {
    pitch
        * (format.luma_height() as usize
            + format.chroma_height() as usize * format.num_chroma_planes() as usize)
}

/// Copies `height` rows of `row_bytes` bytes from `src` to `dst`.
fn copy_plane(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    dst_pitch: usize,
    row_bytes: usize,
    height: usize,
) {
    let src_lines = src.chunks(src_pitch).map(|line| &line[..row_bytes]);
    let dst_lines = dst.chunks_mut(dst_pitch).map(|line| &mut line[..row_bytes]);

    for (src_line, dst_line) in src_lines.zip(dst_lines).take(height) {
        dst_line.copy_from_slice(src_line);
    }
}

/// Splits `height` rows of interleaved UV samples of `sample_bytes` bytes each into separate U
/// and V planes.
#[allow(clippy::too_many_arguments)]
fn deinterleave_plane(
    src: &[u8],
    src_pitch: usize,
    dst_u: &mut [u8],
    dst_v: &mut [u8],
    dst_pitch: usize,
    row_bytes: usize,
    sample_bytes: usize,
    height: usize,
) {
    let src_lines = src.chunks(src_pitch).map(|line| &line[..row_bytes]);
    let dst_lines = dst_u.chunks_mut(dst_pitch).zip(dst_v.chunks_mut(dst_pitch));

    for (src_line, (dst_u_line, dst_v_line)) in src_lines.zip(dst_lines).take(height) {
        for (uv, (u, v)) in src_line.chunks_exact(sample_bytes * 2).zip(
            dst_u_line
                .chunks_exact_mut(sample_bytes)
                .zip(dst_v_line.chunks_exact_mut(sample_bytes)),
        ) {
            u.copy_from_slice(&uv[..sample_bytes]);
            v.copy_from_slice(&uv[sample_bytes..]);
        }
    }
}

/// Copies the visible region of a decode surface, removing its padding.
///
/// With [`OutputFormat::Planar`], interleaved chroma planes are split into U and V planes whose
/// rows are `dst_pitch / 2` bytes apart.
#[derive(Debug, Default)]
pub struct PlaneCopy {
    output_format: OutputFormat,
}

impl PlaneCopy {
    pub fn new(output_format: OutputFormat) -> Self {
        Self { output_format }
    }
}

impl PostProcessor for PlaneCopy {
    fn process(
        &mut self,
        src: &MappedSurface,
        dst: &mut [u8],
        dst_pitch: usize,
        format: &VideoFormatDescriptor,
    ) -> anyhow::Result<()> {
        let bpp = format.bytes_per_pixel() as usize;
        let row_bytes = format.row_bytes();
        let luma_height = format.luma_height() as usize;
        let chroma_height = format.chroma_height() as usize;
        let (x0, y0) = format.surface_offset();
        let (x0, y0) = (x0 as usize * bpp, y0 as usize);
        let chroma_y0 = (y0 as f32 * format.chroma_format().height_factor()) as usize;

        ensure!(
            dst_pitch > 0 && dst_pitch >= row_bytes,
            "output pitch {} is smaller than a row",
            dst_pitch
        );
        ensure!(
            src.pitch > 0 && src.pitch >= x0 + row_bytes,
            "surface pitch {} is too small for {} bytes rows at offset {}",
            src.pitch,
            row_bytes,
            x0
        );
        ensure!(
            dst.len() >= output_frame_size(format, dst_pitch),
            "output buffer of {} bytes is too small",
            dst.len()
        );

        let plane_end = |plane: usize, y: usize, rows: usize| {
            src.plane_offsets[plane] + (y + rows - 1) * src.pitch + x0 + row_bytes
        };
        ensure!(
            luma_height == 0 || plane_end(0, y0, luma_height) <= src.data.len(),
            "luma plane exceeds the mapped surface"
        );
        for plane in 1..=format.num_chroma_planes() as usize {
            ensure!(
                chroma_height == 0 || plane_end(plane, chroma_y0, chroma_height) <= src.data.len(),
                "chroma plane {} exceeds the mapped surface",
                plane
            );
        }

        let (dst_y, dst_chroma) = dst.split_at_mut(dst_pitch * luma_height);
        let src_plane =
            |plane: usize, y: usize| &src.data[src.plane_offsets[plane] + y * src.pitch + x0..];

        // Copy Y.
        copy_plane(src_plane(0, y0), src.pitch, dst_y, dst_pitch, row_bytes, luma_height);

        let interleaved = matches!(
            format.chroma_format(),
            ChromaFormat::Yuv420 | ChromaFormat::Yuv422
        );
        if interleaved && self.output_format == OutputFormat::Planar {
            let half_pitch = dst_pitch / 2;
            let (dst_u, dst_v) = dst_chroma.split_at_mut(half_pitch * chroma_height);
            deinterleave_plane(
                src_plane(1, chroma_y0),
                src.pitch,
                dst_u,
                dst_v,
                half_pitch,
                row_bytes,
                bpp,
                chroma_height,
            );
        } else {
            // Copy the chroma planes as they are.
            for (plane, dst_plane) in dst_chroma
                .chunks_mut(dst_pitch * chroma_height.max(1))
                .take(format.num_chroma_planes() as usize)
                .enumerate()
            {
                copy_plane(
                    src_plane(plane + 1, chroma_y0),
                    src.pitch,
                    dst_plane,
                    dst_pitch,
                    row_bytes,
                    chroma_height,
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RawVideoFormat;
    use crate::reconfig::ReconfigParams;
    use crate::Rect;
    use crate::SurfaceFormat;
    use crate::VideoCodec;

    /// Builds a surface whose samples encode their plane, row and column.
    fn surface(
        width: usize,
        height: usize,
        chroma_height: usize,
        planes: usize,
        pitch: usize,
    ) -> MappedSurface {
        let plane_offsets = [0, pitch * height, pitch * (height + chroma_height)];
        let total = pitch * (height + chroma_height * planes);
        let mut data = vec![0xffu8; total];
        for plane in 0..=planes {
            let rows = if plane == 0 { height } else { chroma_height };
            for y in 0..rows {
                for x in 0..width {
                    data[plane_offsets[plane] + y * pitch + x] = (plane * 100 + y * 10 + x) as u8;
                }
            }
        }

        MappedSurface {
            address: 0,
            picture_index: 0,
            pitch,
            plane_offsets,
            data,
        }
    }

    fn descriptor(
        chroma_format: ChromaFormat,
        coded: (u32, u32),
        display_area: Rect,
    ) -> VideoFormatDescriptor {
        let raw = RawVideoFormat {
            codec: VideoCodec::H264,
            coded_width: coded.0,
            coded_height: coded.1,
            display_area,
            chroma_format,
            ..Default::default()
        };
        VideoFormatDescriptor::new(&raw, SurfaceFormat::Nv12, &ReconfigParams::default())
    }

    #[test]
    fn semi_planar_copy_removes_padding() {
        let format = descriptor(ChromaFormat::Yuv420, (4, 4), Rect::new(0, 0, 4, 4));
        let src = surface(4, 4, 2, 1, 16);
        let mut dst = vec![0u8; format.frame_size()];

        PlaneCopy::default()
            .process(&src, &mut dst, format.row_bytes(), &format)
            .unwrap();

        assert_eq!(&dst[0..4], &[0, 1, 2, 3]);
        assert_eq!(&dst[12..16], &[30, 31, 32, 33]);
        assert_eq!(&dst[16..20], &[100, 101, 102, 103]);
        assert_eq!(&dst[20..24], &[110, 111, 112, 113]);
    }

    #[test]
    fn display_area_offset_is_applied() {
        let format = descriptor(ChromaFormat::Yuv420, (8, 4), Rect::new(2, 2, 6, 4));
        let src = surface(8, 4, 2, 1, 8);
        let mut dst = vec![0u8; format.frame_size()];

        PlaneCopy::default()
            .process(&src, &mut dst, format.row_bytes(), &format)
            .unwrap();

        assert_eq!(&dst[0..4], &[22, 23, 24, 25]);
        assert_eq!(&dst[4..8], &[32, 33, 34, 35]);
        assert_eq!(&dst[8..12], &[112, 113, 114, 115]);
    }

    #[test]
    fn planar_copy_splits_chroma() {
        let format = descriptor(ChromaFormat::Yuv420, (4, 2), Rect::new(0, 0, 4, 2));
        let src = surface(4, 2, 1, 1, 8);
        let mut dst = vec![0u8; format.frame_size()];

        PlaneCopy::new(OutputFormat::Planar)
            .process(&src, &mut dst, format.row_bytes(), &format)
            .unwrap();

        assert_eq!(&dst[0..8], &[0, 1, 2, 3, 10, 11, 12, 13]);
        // U then V, each half a row wide.
        assert_eq!(&dst[8..10], &[100, 102]);
        assert_eq!(&dst[10..12], &[101, 103]);
    }

    #[test]
    fn pitched_output_keeps_rows_apart() {
        let format = descriptor(ChromaFormat::Monochrome, (2, 2), Rect::new(0, 0, 2, 2));
        let src = surface(2, 2, 0, 0, 4);
        let mut dst = vec![0xaau8; output_frame_size(&format, 8)];

        PlaneCopy::default().process(&src, &mut dst, 8, &format).unwrap();

        assert_eq!(dst.len(), 16);
        assert_eq!(&dst[0..2], &[0, 1]);
        assert_eq!(dst[2], 0xaa);
        assert_eq!(&dst[8..10], &[10, 11]);
    }

    #[test]
    fn undersized_buffers_are_rejected() {
        let format = descriptor(ChromaFormat::Yuv420, (4, 4), Rect::new(0, 0, 4, 4));
        let src = surface(4, 4, 2, 1, 16);
        let mut dst = vec![0u8; format.frame_size() - 1];

        assert!(PlaneCopy::default()
            .process(&src, &mut dst, format.row_bytes(), &format)
            .is_err());

        let small = surface(4, 2, 1, 1, 16);
        let mut dst = vec![0u8; format.frame_size()];
        assert!(PlaneCopy::default()
            .process(&small, &mut dst, format.row_bytes(), &format)
            .is_err());
    }
}
