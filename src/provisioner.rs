// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Creation and sizing of the hardware decoder instance and its pool of decode surfaces.

use crate::backend::DecoderBackend;
use crate::backend::DecoderCaps;
use crate::backend::DecoderCreateInfo;
use crate::backend::DecoderHandle;
use crate::backend::DecoderReconfigureInfo;
use crate::backend::DeinterlaceMode;
use crate::backend_call;
use crate::format::RawVideoFormat;
use crate::format::VideoFormatDescriptor;
use crate::session::DecodeError;
use crate::Resolution;

/// Number of decode surfaces that can be mapped at the same time.
pub const NUM_OUTPUT_SURFACES: u32 = 2;

/// Bounds a decoder instance was created with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionedLimits {
    /// Largest coded size the decoder can be reconfigured to.
    pub max_resolution: Resolution,
    /// Number of decode surfaces.
    pub pool_size: u32,
}

/// Checks that the hardware described by `caps` can decode `format`.
pub fn check_caps(format: &RawVideoFormat, caps: &DecoderCaps) -> Result<(), DecodeError> {
    if !caps.supported {
        return Err(DecodeError::Unsupported(format!(
            "{} {} at {} bits is not supported by the hardware",
            format.codec.name(),
            format.chroma_format.name(),
            format.bit_depth_luma_minus8 as u32 + 8
        )));
    }

    let coded = format.coded_resolution();
    if coded.width < caps.min_width
        || coded.height < caps.min_height
        || coded.width > caps.max_width
        || coded.height > caps.max_height
    {
        return Err(DecodeError::Unsupported(format!(
            "coded size {}x{} is outside of the supported range {}x{} to {}x{}",
            coded.width,
            coded.height,
            caps.min_width,
            caps.min_height,
            caps.max_width,
            caps.max_height
        )));
    }

    let mb_count = (coded.width >> 4) * (coded.height >> 4);
    if mb_count > caps.max_mb_count {
        return Err(DecodeError::Unsupported(format!(
            "{} macroblocks exceed the supported maximum of {}",
            mb_count, caps.max_mb_count
        )));
    }

    Ok(())
}

/// Number of decode surfaces to use for `format`.
///
/// This is the stream's minimum, or `requested` if larger, capped by what the hardware supports.
/// Fails if the hardware cannot provide the stream's minimum.
pub fn decode_surface_count(
    format: &RawVideoFormat,
    requested: Option<u32>,
    caps: &DecoderCaps,
) -> Result<u32, DecodeError> {
    let minimum = format.min_num_decode_surfaces.max(1);

    if caps.max_decode_surfaces < minimum {
        return Err(DecodeError::Unsupported(format!(
            "stream needs {} decode surfaces, hardware supports {}",
            minimum, caps.max_decode_surfaces
        )));
    }

    Ok(minimum
        .max(requested.unwrap_or(0))
        .min(caps.max_decode_surfaces))
}

/// Owns the decode backend and the decoder instance created from it.
///
/// At most one decoder instance exists at a time. Failing to create or reconfigure it leaves the
/// provisioner without a usable decoder; the session treats this as fatal.
pub struct SurfaceProvisioner<B: DecoderBackend> {
    backend: B,
    /// Largest coded size requested by the client, if any.
    configured_max: Resolution,
    decoder: Option<DecoderHandle>,
    limits: Option<ProvisionedLimits>,
    provision_count: u32,
    reconfigure_count: u32,
}

impl<B: DecoderBackend> SurfaceProvisioner<B> {
    pub fn new(backend: B, configured_max: Resolution) -> Self {
        Self {
            backend,
            configured_max,
            decoder: None,
            limits: None,
            provision_count: 0,
            reconfigure_count: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The current decoder instance, if any.
    pub fn decoder(&self) -> Option<DecoderHandle> {
        self.decoder
    }

    /// Bounds of the current decoder instance, if any.
    pub fn limits(&self) -> Option<ProvisionedLimits> {
        self.limits
    }

    /// Number of decoder instances created so far.
    pub fn provision_count(&self) -> u32 {
        self.provision_count
    }

    /// Number of in-place reconfigurations performed so far.
    pub fn reconfigure_count(&self) -> u32 {
        self.reconfigure_count
    }

    /// Queries the hardware capabilities for `format` and checks that it can be decoded.
    pub fn query_caps(&mut self, format: &RawVideoFormat) -> Result<DecoderCaps, DecodeError> {
        let caps = backend_call!(self.backend.decoder_caps(
            format.codec,
            format.chroma_format,
            format.bit_depth_luma_minus8
        ))?;
        check_caps(format, &caps)?;

        Ok(caps)
    }

    /// Creates the decoder instance for `desc` with `pool_size` decode surfaces. Returns the
    /// existing instance if there is one.
    pub fn create(
        &mut self,
        desc: &VideoFormatDescriptor,
        pool_size: u32,
    ) -> Result<DecoderHandle, DecodeError> {
        if let Some(decoder) = self.decoder {
            return Ok(decoder);
        }

        let max_resolution = self
            .configured_max
            .max(desc.coded_resolution())
            .max(desc.surface_resolution());
        let info = DecoderCreateInfo {
            codec: desc.codec(),
            chroma_format: desc.chroma_format(),
            bit_depth_minus8: desc.bit_depth_minus8(),
            surface_format: desc.surface_format(),
            deinterlace_mode: if desc.raw().progressive_sequence {
                DeinterlaceMode::Weave
            } else {
                DeinterlaceMode::Adaptive
            },
            coded_resolution: desc.coded_resolution(),
            max_resolution,
            num_decode_surfaces: pool_size,
            num_output_surfaces: NUM_OUTPUT_SURFACES,
            display_area: desc.decode_area(),
            target_resolution: desc.surface_resolution(),
        };

        let decoder = backend_call!(self.backend.create_decoder(&info))?;
        self.decoder = Some(decoder);
        self.limits = Some(ProvisionedLimits {
            max_resolution,
            pool_size,
        });
        self.provision_count += 1;

        log::debug!(
            "Created decoder {:?}: {} surfaces of {:?}, max coded size {:?}",
            decoder,
            pool_size,
            desc.surface_resolution(),
            max_resolution
        );

        Ok(decoder)
    }

    /// Destroys the decoder instance, if any.
    pub fn destroy(&mut self) -> Result<(), DecodeError> {
        self.limits = None;
        if let Some(decoder) = self.decoder.take() {
            backend_call!(self.backend.destroy_decoder(decoder))?;
            log::debug!("Destroyed decoder {:?}", decoder);
        }

        Ok(())
    }

    /// Updates the geometry of the current decoder instance to `desc`, keeping its decode
    /// surface pool.
    pub fn reconfigure(&mut self, desc: &VideoFormatDescriptor) -> Result<(), DecodeError> {
        let (decoder, limits) = match (self.decoder, self.limits) {
            (Some(decoder), Some(limits)) => (decoder, limits),
            _ => return Err(DecodeError::NotConfigured),
        };

        let requested = desc.coded_resolution().max(desc.surface_resolution());
        if !limits.max_resolution.can_contain(requested) {
            return Err(DecodeError::ReconfigureOutOfBounds {
                requested,
                max: limits.max_resolution,
            });
        }

        let info = DecoderReconfigureInfo {
            coded_resolution: desc.coded_resolution(),
            num_decode_surfaces: limits.pool_size,
            display_area: desc.decode_area(),
            target_resolution: desc.surface_resolution(),
        };
        if let Err(e) = backend_call!(self.backend.reconfigure_decoder(decoder, &info)) {
            // The instance is in an unknown state, do not use it anymore.
            self.decoder = None;
            self.limits = None;
            if let Err(destroy_err) = backend_call!(self.backend.destroy_decoder(decoder)) {
                log::warn!(
                    "Failed to destroy decoder {:?} after failed reconfiguration: {}",
                    decoder,
                    destroy_err
                );
            }
            return Err(e.into());
        }
        self.reconfigure_count += 1;

        log::debug!(
            "Reconfigured decoder {:?} to coded size {:?}, output {:?}",
            decoder,
            desc.coded_resolution(),
            desc.output_resolution()
        );

        Ok(())
    }

    /// Replaces the decoder instance by a new one for `desc` with `pool_size` decode surfaces.
    pub fn reprovision(
        &mut self,
        desc: &VideoFormatDescriptor,
        pool_size: u32,
    ) -> Result<DecoderHandle, DecodeError> {
        self.destroy()?;
        self.create(desc, pool_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimBackend;
    use crate::backend::sim::SimOp;
    use crate::backend::STATUS_INVALID_VALUE;
    use crate::backend::STATUS_OUT_OF_MEMORY;
    use crate::parser::sim::simple_format;
    use crate::reconfig::ReconfigController;
    use crate::ChromaFormat;
    use crate::SurfaceFormat;
    use crate::VideoCodec;

    fn raw(width: u32, height: u32, min_surfaces: u32) -> RawVideoFormat {
        simple_format(
            VideoCodec::H264,
            Resolution::from((width, height)),
            ChromaFormat::Yuv420,
            0,
            min_surfaces,
        )
    }

    fn desc(raw: &RawVideoFormat) -> VideoFormatDescriptor {
        ReconfigController::default().descriptor_for(raw, SurfaceFormat::Nv12)
    }

    #[test]
    fn surface_count_policy() {
        let caps = DecoderCaps {
            max_decode_surfaces: 16,
            ..Default::default()
        };

        assert_eq!(decode_surface_count(&raw(64, 64, 4), None, &caps).unwrap(), 4);
        assert_eq!(decode_surface_count(&raw(64, 64, 4), Some(8), &caps).unwrap(), 8);
        assert_eq!(decode_surface_count(&raw(64, 64, 4), Some(2), &caps).unwrap(), 4);
        assert_eq!(decode_surface_count(&raw(64, 64, 4), Some(40), &caps).unwrap(), 16);
        assert_eq!(decode_surface_count(&raw(64, 64, 0), None, &caps).unwrap(), 1);
        assert!(matches!(
            decode_surface_count(&raw(64, 64, 20), None, &caps),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn capability_checks() {
        let mut backend = SimBackend::default();
        let caps = backend
            .decoder_caps(VideoCodec::H264, ChromaFormat::Yuv420, 0)
            .unwrap();

        assert!(check_caps(&raw(1920, 1080, 4), &caps).is_ok());
        assert!(check_caps(&raw(16, 16, 4), &caps).is_err());
        assert!(check_caps(&raw(8200, 64, 4), &caps).is_err());

        let few_macroblocks = DecoderCaps {
            max_mb_count: 100,
            ..caps.clone()
        };
        assert!(check_caps(&raw(320, 240, 4), &few_macroblocks).is_err());
        assert!(check_caps(&raw(160, 160, 4), &few_macroblocks).is_ok());

        let unsupported = DecoderCaps {
            supported: false,
            ..caps
        };
        assert!(matches!(
            check_caps(&raw(320, 240, 4), &unsupported),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn query_caps_reports_unsupported_codec() {
        let mut backend = SimBackend::default();
        backend.set_unsupported(VideoCodec::H264);
        let mut provisioner = SurfaceProvisioner::new(backend, Default::default());

        assert!(matches!(
            provisioner.query_caps(&raw(320, 240, 4)),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn create_is_idempotent() {
        let mut provisioner = SurfaceProvisioner::new(SimBackend::default(), Default::default());
        let raw = raw(320, 240, 4);

        let first = provisioner.create(&desc(&raw), 4).unwrap();
        let second = provisioner.create(&desc(&raw), 6).unwrap();

        assert_eq!(first, second);
        assert_eq!(provisioner.provision_count(), 1);
        assert_eq!(provisioner.backend().live_decoders(), 1);
        assert_eq!(
            provisioner.limits(),
            Some(ProvisionedLimits {
                max_resolution: Resolution::from((320, 240)),
                pool_size: 4
            })
        );
    }

    #[test]
    fn configured_max_bounds_the_decoder() {
        let mut provisioner =
            SurfaceProvisioner::new(SimBackend::default(), Resolution::from((1280, 720)));
        let decoder = provisioner.create(&desc(&raw(320, 240, 4)), 4).unwrap();

        let info = provisioner.backend().decoder_info(decoder).unwrap();
        assert_eq!(info.max_resolution, Resolution::from((1280, 720)));
        assert_eq!(info.num_output_surfaces, NUM_OUTPUT_SURFACES);

        provisioner.reconfigure(&desc(&raw(1280, 720, 4))).unwrap();
        assert_eq!(provisioner.reconfigure_count(), 1);
        assert_eq!(provisioner.provision_count(), 1);

        assert!(matches!(
            provisioner.reconfigure(&desc(&raw(1920, 1080, 4))),
            Err(DecodeError::ReconfigureOutOfBounds { .. })
        ));
        assert_eq!(provisioner.decoder(), Some(decoder));
    }

    #[test]
    fn reprovision_replaces_the_decoder() {
        let mut provisioner = SurfaceProvisioner::new(SimBackend::default(), Default::default());
        let first = provisioner.create(&desc(&raw(320, 240, 4)), 4).unwrap();
        let second = provisioner.reprovision(&desc(&raw(640, 480, 6)), 6).unwrap();

        assert_ne!(first, second);
        assert_eq!(provisioner.provision_count(), 2);
        assert_eq!(provisioner.backend().stats().decoders_destroyed, 1);
        assert_eq!(provisioner.backend().live_decoders(), 1);
        assert_eq!(provisioner.limits().map(|l| l.pool_size), Some(6));
    }

    #[test]
    fn failed_creation_leaves_no_decoder() {
        let mut backend = SimBackend::default();
        backend.fail_next(SimOp::Create, STATUS_OUT_OF_MEMORY);
        let mut provisioner = SurfaceProvisioner::new(backend, Default::default());

        let err = provisioner.create(&desc(&raw(320, 240, 4)), 4).unwrap_err();
        assert!(matches!(err, DecodeError::Backend(ref e) if e.code == STATUS_OUT_OF_MEMORY));
        assert!(err.to_string().contains("create_decoder"));
        assert_eq!(provisioner.decoder(), None);
        assert_eq!(provisioner.provision_count(), 0);
    }

    #[test]
    fn failed_reconfiguration_drops_the_decoder() {
        let mut provisioner = SurfaceProvisioner::new(SimBackend::default(), Default::default());
        provisioner.create(&desc(&raw(320, 240, 4)), 4).unwrap();
        provisioner
            .backend_mut()
            .fail_next(SimOp::Reconfigure, STATUS_OUT_OF_MEMORY);

        assert!(matches!(
            provisioner.reconfigure(&desc(&raw(320, 240, 4))),
            Err(DecodeError::Backend(_))
        ));
        assert_eq!(provisioner.decoder(), None);
        assert_eq!(provisioner.backend().live_decoders(), 0);
        assert!(matches!(
            provisioner.reconfigure(&desc(&raw(320, 240, 4))),
            Err(DecodeError::NotConfigured)
        ));
    }

    #[test]
    fn reconfiguration_error_wins_over_destroy_error() {
        let mut provisioner = SurfaceProvisioner::new(SimBackend::default(), Default::default());
        provisioner.create(&desc(&raw(320, 240, 4)), 4).unwrap();
        provisioner
            .backend_mut()
            .fail_next(SimOp::Reconfigure, STATUS_OUT_OF_MEMORY);
        provisioner
            .backend_mut()
            .fail_next(SimOp::Destroy, STATUS_INVALID_VALUE);

        let err = provisioner
            .reconfigure(&desc(&raw(320, 240, 4)))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Backend(ref e) if e.code == STATUS_OUT_OF_MEMORY));
        assert!(err.to_string().contains("reconfigure_decoder"));
        assert_eq!(provisioner.decoder(), None);
        // The driver kept the instance it failed to destroy.
        assert_eq!(provisioner.backend().live_decoders(), 1);
        assert_eq!(provisioner.backend().stats().decoders_destroyed, 0);
    }
}
