// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software decode backend whose only purpose is to let the session run without hardware.
//!
//! Decoded surfaces are filled with a pattern derived from the picture index and the number of
//! pictures decoded so far, so that different frames can be told apart by their checksum.

use std::collections::HashMap;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::backend::DecoderBackend;
use crate::backend::DecoderCaps;
use crate::backend::DecoderCreateInfo;
use crate::backend::DecoderHandle;
use crate::backend::DecoderReconfigureInfo;
use crate::backend::MappedSurface;
use crate::backend::PictureParams;
use crate::backend::ProcParams;
use crate::backend::Status;
use crate::backend::STATUS_INVALID_HANDLE;
use crate::backend::STATUS_INVALID_VALUE;
use crate::backend::STATUS_NOT_MAPPED;
use crate::backend::STATUS_OUT_OF_MEMORY;
use crate::ChromaFormat;
use crate::Resolution;
use crate::VideoCodec;

/// Rows of every plane are aligned to this many bytes.
const PITCH_ALIGNMENT: usize = 64;

/// Backend operations that can be made to fail with [`SimBackend::fail_next`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    Caps,
    Create,
    Reconfigure,
    Destroy,
    DecodePicture,
    Map,
    Unmap,
}

/// Counters describing what the backend has been asked to do.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub decoders_created: u32,
    pub decoders_destroyed: u32,
    pub reconfigurations: u32,
    pub pictures_decoded: u64,
    pub frames_mapped: u64,
    /// Largest number of surfaces mapped at the same time.
    pub max_concurrent_maps: u32,
    /// Output stream of the last mapping.
    pub last_output_stream: u64,
}

struct SimDecoder {
    info: DecoderCreateInfo,
    /// Serial number of the last picture decoded into each surface.
    surfaces: HashMap<u32, u64>,
    mapped: u32,
}

/// A [`DecoderBackend`] implemented in software.
pub struct SimBackend {
    caps: DecoderCaps,
    unsupported_codecs: Vec<VideoCodec>,
    decoders: HashMap<u64, SimDecoder>,
    next_handle: u64,
    next_address: u64,
    failures: HashMap<SimOp, Status>,
    stats: SimStats,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(DecoderCaps {
            supported: true,
            output_format_mask: 0xf,
            min_width: 48,
            min_height: 16,
            max_width: 8192,
            max_height: 8192,
            max_mb_count: (8192 / 16) * (8192 / 16),
            max_decode_surfaces: 32,
        })
    }
}

impl SimBackend {
    pub fn new(caps: DecoderCaps) -> Self {
        Self {
            caps,
            unsupported_codecs: Vec::new(),
            decoders: HashMap::new(),
            next_handle: 1,
            next_address: 0x1000,
            failures: HashMap::new(),
            stats: Default::default(),
        }
    }

    /// Makes `codec` report as unsupported by the hardware.
    pub fn set_unsupported(&mut self, codec: VideoCodec) {
        self.unsupported_codecs.push(codec);
    }

    /// Makes the next call to `op` fail with `status`.
    pub fn fail_next(&mut self, op: SimOp, status: Status) {
        self.failures.insert(op, status);
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Number of decoder instances currently alive.
    pub fn live_decoders(&self) -> usize {
        self.decoders.len()
    }

    /// Returns the parameters the live decoder `handle` currently runs with.
    pub fn decoder_info(&self, handle: DecoderHandle) -> Option<&DecoderCreateInfo> {
        self.decoders.get(&handle.0).map(|d| &d.info)
    }

    fn check_failure(&mut self, op: SimOp) -> Result<(), Status> {
        match self.failures.remove(&op) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn decoder_mut(&mut self, handle: DecoderHandle) -> Result<&mut SimDecoder, Status> {
        self.decoders
            .get_mut(&handle.0)
            .ok_or(STATUS_INVALID_HANDLE)
    }
}

/// Value of the sample at (`x`, `y`) of `plane` for the picture with serial number `serial`.
fn pattern(serial: u64, plane: usize, x: usize, y: usize) -> u16 {
    ((serial as usize * 31 + plane * 67 + x * 3 + y * 5) & 0xff) as u16
}

fn fill_surface(info: &DecoderCreateInfo, serial: u64) -> MappedSurface {
    let Resolution { width, height } = info.target_resolution;
    let (width, height) = (width as usize, height as usize);
    let bytes_per_sample = if info.surface_format.is_high_bit_depth() { 2 } else { 1 };
    let row_bytes = width * bytes_per_sample;
    let pitch = (row_bytes + PITCH_ALIGNMENT - 1) / PITCH_ALIGNMENT * PITCH_ALIGNMENT;
    let chroma_height = (height as f32 * info.chroma_format.height_factor()).ceil() as usize;
    let chroma_planes = info.chroma_format.plane_count() as usize;

    let plane_heights = [
        height,
        if chroma_planes >= 1 { chroma_height } else { 0 },
        if chroma_planes >= 2 { chroma_height } else { 0 },
    ];
    let plane_offsets = [
        0,
        pitch * plane_heights[0],
        pitch * (plane_heights[0] + plane_heights[1]),
    ];
    let mut data = vec![0u8; pitch * plane_heights.iter().sum::<usize>()];

    for (plane, (&offset, &rows)) in plane_offsets.iter().zip(plane_heights.iter()).enumerate() {
        for y in 0..rows {
            let row = &mut data[offset + y * pitch..offset + y * pitch + row_bytes];
            for x in 0..width {
                let value = pattern(serial, plane, x, y);
                if bytes_per_sample == 2 {
                    // High bit depth samples are MSB-aligned in 16-bit little endian words.
                    LittleEndian::write_u16(&mut row[x * 2..x * 2 + 2], value << 8);
                } else {
                    row[x] = value as u8;
                }
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

impl DecoderBackend for SimBackend {
    fn decoder_caps(
        &mut self,
        codec: VideoCodec,
        chroma_format: ChromaFormat,
        bit_depth_minus8: u8,
    ) -> Result<DecoderCaps, Status> {
        self.check_failure(SimOp::Caps)?;

        let mut caps = self.caps.clone();
        if self.unsupported_codecs.contains(&codec)
            || bit_depth_minus8 > 4
            || (chroma_format == ChromaFormat::Yuv422 && codec != VideoCodec::Hevc)
        {
            caps.supported = false;
        }
        Ok(caps)
    }

    fn create_decoder(&mut self, info: &DecoderCreateInfo) -> Result<DecoderHandle, Status> {
        self.check_failure(SimOp::Create)?;

        if info.num_decode_surfaces == 0 || info.num_decode_surfaces > self.caps.max_decode_surfaces
        {
            return Err(STATUS_OUT_OF_MEMORY);
        }
        if !info.max_resolution.can_contain(info.coded_resolution) {
            return Err(STATUS_INVALID_VALUE);
        }

        let handle = DecoderHandle(self.next_handle);
        self.next_handle += 1;
        self.decoders.insert(
            handle.0,
            SimDecoder {
                info: info.clone(),
                surfaces: HashMap::new(),
                mapped: 0,
            },
        );
        self.stats.decoders_created += 1;
        log::debug!(
            "sim: created decoder {} ({} surfaces, coded {:?}, max {:?})",
            handle.0,
            info.num_decode_surfaces,
            info.coded_resolution,
            info.max_resolution
        );

        Ok(handle)
    }

    fn reconfigure_decoder(
        &mut self,
        decoder: DecoderHandle,
        info: &DecoderReconfigureInfo,
    ) -> Result<(), Status> {
        self.check_failure(SimOp::Reconfigure)?;

        let sim_decoder = self.decoder_mut(decoder)?;
        if !sim_decoder.info.max_resolution.can_contain(info.coded_resolution)
            || info.num_decode_surfaces > sim_decoder.info.num_decode_surfaces
        {
            return Err(STATUS_INVALID_VALUE);
        }

        sim_decoder.info.coded_resolution = info.coded_resolution;
        sim_decoder.info.display_area = info.display_area;
        sim_decoder.info.target_resolution = info.target_resolution;
        sim_decoder.surfaces.clear();
        self.stats.reconfigurations += 1;

        Ok(())
    }

    fn destroy_decoder(&mut self, decoder: DecoderHandle) -> Result<(), Status> {
        self.check_failure(SimOp::Destroy)?;

        self.decoders
            .remove(&decoder.0)
            .ok_or(STATUS_INVALID_HANDLE)?;
        self.stats.decoders_destroyed += 1;

        Ok(())
    }

    fn decode_picture(
        &mut self,
        decoder: DecoderHandle,
        params: &PictureParams,
    ) -> Result<(), Status> {
        self.check_failure(SimOp::DecodePicture)?;

        let serial = self.stats.pictures_decoded;
        let sim_decoder = self.decoder_mut(decoder)?;
        if params.picture_index >= sim_decoder.info.num_decode_surfaces {
            return Err(STATUS_INVALID_VALUE);
        }
        sim_decoder.surfaces.insert(params.picture_index, serial);
        self.stats.pictures_decoded += 1;

        Ok(())
    }

    fn map_frame(
        &mut self,
        decoder: DecoderHandle,
        picture_index: u32,
        params: &ProcParams,
    ) -> Result<MappedSurface, Status> {
        self.check_failure(SimOp::Map)?;

        let address = self.next_address;
        let sim_decoder = self.decoder_mut(decoder)?;
        let serial = *sim_decoder
            .surfaces
            .get(&picture_index)
            .ok_or(STATUS_INVALID_VALUE)?;
        if sim_decoder.mapped >= sim_decoder.info.num_output_surfaces {
            return Err(STATUS_OUT_OF_MEMORY);
        }
        sim_decoder.mapped += 1;
        let mapped = sim_decoder.mapped;

        let mut surface = fill_surface(&sim_decoder.info, serial);
        surface.address = address;
        surface.picture_index = picture_index;

        self.next_address += 0x1000;
        self.stats.frames_mapped += 1;
        self.stats.max_concurrent_maps = self.stats.max_concurrent_maps.max(mapped);
        self.stats.last_output_stream = params.output_stream;

        Ok(surface)
    }

    fn unmap_frame(&mut self, decoder: DecoderHandle, _surface: MappedSurface) -> Result<(), Status> {
        self.check_failure(SimOp::Unmap)?;

        let sim_decoder = self.decoder_mut(decoder)?;
        if sim_decoder.mapped == 0 {
            return Err(STATUS_NOT_MAPPED);
        }
        sim_decoder.mapped -= 1;

        Ok(())
    }
}
