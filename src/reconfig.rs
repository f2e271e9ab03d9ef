// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Output geometry changes, whether requested by the client or caused by the stream.

use crate::format::RawVideoFormat;
use crate::format::VideoFormatDescriptor;
use crate::provisioner::ProvisionedLimits;
use crate::session::DecodeError;
use crate::Rect;
use crate::Resolution;
use crate::SurfaceFormat;

/// Post-processing requested by the client.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconfigParams {
    /// Region of the coded frame to output instead of the stream's display area.
    pub crop: Option<Rect>,
    /// Size to scale the output to.
    pub resize: Option<Resolution>,
}

impl ReconfigParams {
    pub fn new(crop: Option<Rect>, resize: Option<Resolution>) -> Self {
        Self { crop, resize }
    }

    /// Whether no post-processing is requested.
    pub fn is_empty(&self) -> bool {
        self.crop.is_none() && self.resize.is_none()
    }

    /// Checks that the parameters make sense on their own, and that the crop region lies within
    /// `coded` if given.
    pub fn validate(&self, coded: Option<Resolution>) -> Result<(), DecodeError> {
        if let Some(crop) = self.crop {
            if crop.is_empty() || crop.left < 0 || crop.top < 0 {
                return Err(DecodeError::InvalidReconfigParams(format!(
                    "invalid crop rectangle {:?}",
                    crop
                )));
            }
            if let Some(coded) = coded {
                if !crop.fits_in(coded) {
                    return Err(DecodeError::InvalidReconfigParams(format!(
                        "crop rectangle {:?} exceeds coded size {:?}",
                        crop, coded
                    )));
                }
            }
        }

        if let Some(resize) = self.resize {
            if resize.even().is_empty() {
                return Err(DecodeError::InvalidReconfigParams(format!(
                    "invalid resize dimensions {:?}",
                    resize
                )));
            }
        }

        Ok(())
    }

    /// Returns the parameters adjusted to a stream of size `coded`: the crop region is clipped
    /// to the coded frame, and dropped if nothing of it remains.
    pub fn clipped_to(&self, coded: Resolution) -> Self {
        let crop = self.crop.and_then(|crop| {
            let clipped = Rect::new(
                crop.left,
                crop.top,
                crop.right.min(coded.width as i32),
                crop.bottom.min(coded.height as i32),
            );
            if clipped.size().even().is_empty() {
                log::debug!(
                    "Crop {:?} lies outside of coded size {:?}, ignoring it",
                    crop,
                    coded
                );
                None
            } else {
                Some(clipped)
            }
        });

        Self {
            crop,
            resize: self.resize,
        }
    }
}

/// Why a new sequence cannot reuse the current decoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReprovisionReason {
    CodecChanged,
    ChromaFormatChanged,
    BitDepthChanged,
    /// The coded size exceeds the largest size the decoder was created for.
    ExceedsMaxResolution,
    /// The stream needs more decode surfaces than the decoder has.
    NotEnoughSurfaces,
}

/// How a sequence header compares to the active stream format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SequenceChange {
    Unchanged,
    /// The decoder can be reconfigured without being recreated.
    InPlace,
    /// The decoder must be destroyed and created again.
    Reprovision(ReprovisionReason),
}

/// Classifies `incoming` against the `active` format of a decoder provisioned with `limits`.
/// `required_pool` is the number of decode surfaces the incoming stream needs.
pub fn classify(
    active: &VideoFormatDescriptor,
    limits: &ProvisionedLimits,
    incoming: &RawVideoFormat,
    required_pool: u32,
) -> SequenceChange {
    let current = active.raw();

    if current == incoming {
        return SequenceChange::Unchanged;
    }

    let reason = if incoming.codec != current.codec {
        Some(ReprovisionReason::CodecChanged)
    } else if incoming.chroma_format != current.chroma_format {
        Some(ReprovisionReason::ChromaFormatChanged)
    } else if incoming.bit_depth_luma_minus8 != current.bit_depth_luma_minus8
        || incoming.bit_depth_chroma_minus8 != current.bit_depth_chroma_minus8
    {
        Some(ReprovisionReason::BitDepthChanged)
    } else if !limits
        .max_resolution
        .can_contain(incoming.coded_resolution())
    {
        Some(ReprovisionReason::ExceedsMaxResolution)
    } else if required_pool > limits.pool_size {
        Some(ReprovisionReason::NotEnoughSurfaces)
    } else {
        None
    };

    match reason {
        Some(reason) => SequenceChange::Reprovision(reason),
        None => SequenceChange::InPlace,
    }
}

/// Keeps track of the requested post-processing and computes the geometry it results in.
#[derive(Debug, Default)]
pub struct ReconfigController {
    params: ReconfigParams,
}

impl ReconfigController {
    /// Currently requested parameters.
    pub fn params(&self) -> ReconfigParams {
        self.params
    }

    /// Replaces the requested parameters without any stream to check them against. Used before
    /// the first sequence header.
    pub fn set(&mut self, params: ReconfigParams) -> Result<(), DecodeError> {
        params.validate(None)?;
        self.params = params;
        Ok(())
    }

    /// Returns the descriptor of a stream of format `raw` decoded into `surface_format`, with
    /// the requested parameters applied.
    pub fn descriptor_for(
        &self,
        raw: &RawVideoFormat,
        surface_format: SurfaceFormat,
    ) -> VideoFormatDescriptor {
        let params = self.params.clipped_to(raw.coded_resolution());
        VideoFormatDescriptor::new(raw, surface_format, &params)
    }

    /// Applies `params` to the `active` stream of a decoder provisioned with `limits`.
    ///
    /// On success the parameters become the requested ones and the resulting descriptor is
    /// returned, ready for an in-place reconfiguration. On failure nothing changes.
    pub fn apply(
        &mut self,
        params: ReconfigParams,
        active: &VideoFormatDescriptor,
        limits: &ProvisionedLimits,
    ) -> Result<VideoFormatDescriptor, DecodeError> {
        params.validate(Some(active.coded_resolution()))?;

        let desc = VideoFormatDescriptor::new(active.raw(), active.surface_format(), &params);
        let requested = desc.surface_resolution();
        if !limits.max_resolution.can_contain(requested) {
            return Err(DecodeError::ReconfigureOutOfBounds {
                requested,
                max: limits.max_resolution,
            });
        }

        log::debug!(
            "Reconfiguring output from {:?} to {:?}",
            active.output_resolution(),
            desc.output_resolution()
        );
        self.params = params;

        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::sim::simple_format;
    use crate::ChromaFormat;
    use crate::VideoCodec;

    fn raw(width: u32, height: u32) -> RawVideoFormat {
        simple_format(
            VideoCodec::H264,
            Resolution::from((width, height)),
            ChromaFormat::Yuv420,
            0,
            4,
        )
    }

    fn limits(width: u32, height: u32, pool_size: u32) -> ProvisionedLimits {
        ProvisionedLimits {
            max_resolution: Resolution::from((width, height)),
            pool_size,
        }
    }

    fn active(width: u32, height: u32) -> VideoFormatDescriptor {
        ReconfigController::default().descriptor_for(&raw(width, height), SurfaceFormat::Nv12)
    }

    #[test]
    fn classify_sequence_changes() {
        let active = active(640, 480);
        let limits = limits(1280, 720, 4);

        assert_eq!(
            classify(&active, &limits, &raw(640, 480), 4),
            SequenceChange::Unchanged
        );
        assert_eq!(
            classify(&active, &limits, &raw(1280, 720), 4),
            SequenceChange::InPlace
        );
        assert_eq!(
            classify(&active, &limits, &raw(320, 240), 2),
            SequenceChange::InPlace
        );
        assert_eq!(
            classify(&active, &limits, &raw(1920, 1080), 4),
            SequenceChange::Reprovision(ReprovisionReason::ExceedsMaxResolution)
        );
        assert_eq!(
            classify(&active, &limits, &raw(640, 480), 6),
            SequenceChange::Reprovision(ReprovisionReason::NotEnoughSurfaces)
        );

        let mut ten_bit = raw(640, 480);
        ten_bit.bit_depth_luma_minus8 = 2;
        ten_bit.bit_depth_chroma_minus8 = 2;
        assert_eq!(
            classify(&active, &limits, &ten_bit, 4),
            SequenceChange::Reprovision(ReprovisionReason::BitDepthChanged)
        );

        let mut yuv444 = raw(640, 480);
        yuv444.chroma_format = ChromaFormat::Yuv444;
        assert_eq!(
            classify(&active, &limits, &yuv444, 4),
            SequenceChange::Reprovision(ReprovisionReason::ChromaFormatChanged)
        );
    }

    #[test]
    fn apply_within_bounds() {
        let active = active(1920, 1080);
        let limits = limits(1920, 1088, 8);
        let mut controller = ReconfigController::default();

        let params = ReconfigParams::new(None, Some(Resolution::from((1280, 720))));
        let desc = controller.apply(params, &active, &limits).unwrap();

        assert_eq!(desc.output_resolution(), Resolution::from((1280, 720)));
        assert_eq!(desc.frame_size(), 1280 * (720 + 360));
        assert_eq!(controller.params(), params);
    }

    #[test]
    fn apply_out_of_bounds_keeps_previous_params() {
        let active = active(640, 480);
        let limits = limits(640, 480, 4);
        let mut controller = ReconfigController::default();

        let err = controller
            .apply(
                ReconfigParams::new(None, Some(Resolution::from((1280, 720)))),
                &active,
                &limits,
            )
            .unwrap_err();

        assert!(matches!(
            err,
            DecodeError::ReconfigureOutOfBounds { requested, max }
                if requested == Resolution::from((1280, 720)) && max == Resolution::from((640, 480))
        ));
        assert!(controller.params().is_empty());
    }

    #[test]
    fn invalid_params_are_rejected() {
        let active = active(640, 480);
        let limits = limits(640, 480, 4);
        let mut controller = ReconfigController::default();

        for params in [
            ReconfigParams::new(Some(Rect::new(10, 10, 10, 50)), None),
            ReconfigParams::new(Some(Rect::new(0, 0, 700, 480)), None),
            ReconfigParams::new(None, Some(Resolution::from((1, 1)))),
        ] {
            assert!(matches!(
                controller.apply(params, &active, &limits),
                Err(DecodeError::InvalidReconfigParams(_))
            ));
        }

        assert!(controller
            .set(ReconfigParams::new(Some(Rect::new(-2, 0, 10, 10)), None))
            .is_err());
        for crop in [
            Rect::new(i32::MIN, 0, 10, 10),
            Rect::new(0, i32::MIN, 10, i32::MAX),
            Rect::new(i32::MAX, 0, i32::MIN, 10),
        ] {
            assert!(matches!(
                ReconfigParams::new(Some(crop), None).validate(Some(Resolution::from((640, 480)))),
                Err(DecodeError::InvalidReconfigParams(_))
            ));
        }
        assert!(controller
            .set(ReconfigParams::new(Some(Rect::new(0, 0, 320, 240)), None))
            .is_ok());
    }

    #[test]
    fn crop_is_clipped_to_coded_size() {
        let mut controller = ReconfigController::default();
        controller
            .set(ReconfigParams::new(Some(Rect::new(0, 0, 640, 480)), None))
            .unwrap();

        let desc = controller.descriptor_for(&raw(320, 240), SurfaceFormat::Nv12);
        assert_eq!(desc.output_resolution(), Resolution::from((320, 240)));

        controller
            .set(ReconfigParams::new(Some(Rect::new(400, 300, 640, 480)), None))
            .unwrap();
        let desc = controller.descriptor_for(&raw(320, 240), SurfaceFormat::Nv12);
        assert_eq!(desc.display_area(), Rect::new(0, 0, 320, 240));
    }
}
