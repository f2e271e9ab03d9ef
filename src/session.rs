// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pull-based decoding session on top of a callback-driven parser.
//!
//! [`Session::decode`] hands a chunk of bitstream to the parser, which synchronously calls back
//! into the session to report format changes, submit pictures for decoding, and display decoded
//! pictures. Displayed pictures are copied into the session's [`FrameRing`], and handed to the
//! caller as [`FrameLease`]s once the parser returns.
//!
//! Callbacks cannot return errors to the parser, only a failure status. The first error raised
//! from a callback is kept aside and returned by `decode` once the parser gives control back.
//! Driver failures poison the session: every subsequent call fails with
//! [`DecodeError::Poisoned`].

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::DecoderBackend;
use crate::backend::DisplayInfo;
use crate::backend::PictureParams;
use crate::backend::ProcParams;
use crate::backend_call;
use crate::format::choose_surface_format;
use crate::format::RawVideoFormat;
use crate::format::VideoFormatDescriptor;
use crate::frame_ring::BackpressurePolicy;
use crate::frame_ring::FrameLease;
use crate::frame_ring::FrameRing;
use crate::image_processing::output_frame_size;
use crate::image_processing::PlaneCopy;
use crate::image_processing::PostProcessor;
use crate::parser::BitstreamPacket;
use crate::parser::PacketFlags;
use crate::parser::ParserCallbacks;
use crate::parser::ParserParams;
use crate::parser::SequenceResponse;
use crate::parser::VideoParser;
use crate::provisioner::decode_surface_count;
use crate::provisioner::SurfaceProvisioner;
use crate::reconfig::classify;
use crate::reconfig::ReconfigController;
use crate::reconfig::ReconfigParams;
use crate::reconfig::SequenceChange;
use crate::tracker::DecodeOrderTracker;
use crate::tracker::DEFAULT_DECODE_HISTORY;
use crate::OutputFormat;
use crate::Rect;
use crate::Resolution;
use crate::SurfaceFormat;
use crate::VideoCodec;

/// Rows of pitched output frames are aligned to this many bytes.
pub const PITCHED_FRAME_ALIGNMENT: usize = 256;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The picture is kept by the session and delivered by the next call to
    /// [`Session::decode`] once a slot has been unlocked.
    #[error(
        "no frame slot for picture {picture_index} (timestamp {timestamp}), \
         all {capacity} slots are in use"
    )]
    OutOfFrameSlots {
        capacity: usize,
        picture_index: u32,
        timestamp: i64,
    },
    #[error("no sequence header has been decoded yet")]
    NotConfigured,
    #[error("requested size {requested:?} exceeds the provisioned maximum {max:?}")]
    ReconfigureOutOfBounds {
        requested: Resolution,
        max: Resolution,
    },
    #[error("invalid reconfiguration parameters: {0}")]
    InvalidReconfigParams(String),
    #[error("unsupported stream: {0}")]
    Unsupported(String),
    #[error("session is unusable after a previous error: {0}")]
    Poisoned(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DecodeError {
    /// Whether the error leaves the session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::Backend(_)
                | DecodeError::Unsupported(_)
                | DecodeError::Poisoned(_)
                | DecodeError::Other(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Options a [`Session`] is created with.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub codec: VideoCodec,
    /// Layout of the frames handed to the client.
    pub output_format: OutputFormat,
    /// Whether output frames are meant to stay in device memory.
    pub use_device_frame: bool,
    /// Whether device frames have their rows aligned to [`PITCHED_FRAME_ALIGNMENT`].
    pub device_frame_pitched: bool,
    /// Display pictures as soon as they are decoded, and treat each packet as a full picture.
    pub low_latency: bool,
    pub crop: Option<Rect>,
    pub resize: Option<Resolution>,
    /// Largest coded width the decoder should be able to reconfigure to without being recreated.
    /// 0 means the width of the first sequence.
    pub max_width: u32,
    pub max_height: u32,
    /// Number of decode surfaces to use if larger than what the stream requires.
    pub decode_surfaces: Option<u32>,
    /// Number of pictures the parser may hold back. Defaults to 1, or 0 in low latency mode.
    pub max_display_delay: Option<u32>,
    /// Timestamp units in Hz, 0 for the parser's default.
    pub clock_rate: u32,
    /// Percentage of corrupted bitstream above which pictures are not decoded.
    pub error_threshold: u32,
    pub backpressure: BackpressurePolicy,
    /// Number of decode operations remembered for diagnostics.
    pub decode_history: usize,
    /// Driver stream that mapping and post-processing of decoded surfaces run on. 0 is the
    /// driver's default stream.
    pub output_stream: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            output_format: OutputFormat::SemiPlanar,
            use_device_frame: false,
            device_frame_pitched: false,
            low_latency: false,
            crop: None,
            resize: None,
            max_width: 0,
            max_height: 0,
            decode_surfaces: None,
            max_display_delay: None,
            clock_rate: 0,
            error_threshold: 100,
            backpressure: Default::default(),
            decode_history: DEFAULT_DECODE_HISTORY,
            output_stream: 0,
        }
    }
}

impl SessionConfig {
    pub fn parser_params(&self) -> ParserParams {
        ParserParams {
            codec: self.codec,
            // Updated by the sequence callback once the stream requirements are known.
            max_decode_surfaces: 1,
            clock_rate: self.clock_rate,
            error_threshold: self.error_threshold,
            max_display_delay: self
                .max_display_delay
                .unwrap_or(if self.low_latency { 0 } else { 1 }),
        }
    }

    /// Distance in bytes between two rows of an output frame of `format`.
    fn frame_pitch(&self, format: &VideoFormatDescriptor) -> usize {
        let row_bytes = format.row_bytes();
        if self.use_device_frame && self.device_frame_pitched {
            (row_bytes + PITCHED_FRAME_ALIGNMENT - 1) / PITCHED_FRAME_ALIGNMENT
                * PITCHED_FRAME_ALIGNMENT
        } else {
            row_bytes
        }
    }
}

/// Session state reachable from the parser callbacks.
struct SessionCore<B: DecoderBackend> {
    config: SessionConfig,
    provisioner: SurfaceProvisioner<B>,
    reconfig: ReconfigController,
    tracker: DecodeOrderTracker,
    ring: FrameRing,
    post_processor: Box<dyn PostProcessor>,
    format: Option<VideoFormatDescriptor>,
    /// Number of decode surfaces of the current decoder.
    pool_size: u32,
    frame_pitch: usize,
    /// First error raised by a callback during the current parse call.
    callback_error: Option<DecodeError>,
    /// Picture displayed by the parser that could not be queued for lack of a free slot.
    deferred_display: Option<DisplayInfo>,
    /// Frames handed out by [`Session::decode_borrowed`], unlocked on the next decode.
    borrowed: Vec<FrameLease>,
    poisoned: Option<String>,
    decode_picture_count: u64,
    decoded_frame_count: u64,
    end_of_stream: bool,
}

impl<B: DecoderBackend> SessionCore<B> {
    fn check_poisoned(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(DecodeError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, error: &DecodeError) {
        log::debug!("Poisoning session: {}", error);
        self.poisoned = Some(error.to_string());
    }

    /// Keeps `error` to be returned once the parser gives control back.
    fn set_error(&mut self, error: DecodeError) {
        match self.callback_error {
            None => self.callback_error = Some(error),
            Some(_) => log::debug!("Dropping subsequent callback error: {}", error),
        }
    }

    /// Makes `desc` the active format and sizes the frame ring for it.
    fn activate(&mut self, desc: VideoFormatDescriptor) {
        self.frame_pitch = self.config.frame_pitch(&desc);
        self.ring.configure(
            self.pool_size as usize,
            output_frame_size(&desc, self.frame_pitch),
        );
        self.format = Some(desc);
    }

    fn handle_sequence(&mut self, raw: &RawVideoFormat) -> Result<u32> {
        let caps = self.provisioner.query_caps(raw)?;
        let required = decode_surface_count(raw, self.config.decode_surfaces, &caps)?;
        let surface_format = choose_surface_format(raw, &caps)?;
        let desc = self.reconfig.descriptor_for(raw, surface_format);

        let change = match (&self.format, self.provisioner.limits()) {
            (Some(active), Some(limits)) => Some(classify(active, &limits, raw, required)),
            _ => None,
        };

        match change {
            None => {
                self.provisioner.create(&desc, required)?;
                self.pool_size = required;
            }
            Some(SequenceChange::Unchanged) => return Ok(self.pool_size),
            Some(SequenceChange::InPlace) => {
                log::debug!("Sequence change handled in place");
                self.provisioner.reconfigure(&desc)?;
            }
            Some(SequenceChange::Reprovision(reason)) => {
                log::debug!("Sequence change requires a new decoder: {:?}", reason);
                self.provisioner.reprovision(&desc, required)?;
                self.tracker.clear();
                self.pool_size = required;
            }
        }

        log::info!("{}", desc.video_info(self.pool_size));
        self.activate(desc);

        Ok(self.pool_size)
    }

    fn handle_decode(&mut self, params: &PictureParams) -> Result<()> {
        let decoder = self.provisioner.decoder().ok_or(DecodeError::NotConfigured)?;
        backend_call!(self.provisioner.backend_mut().decode_picture(decoder, params))?;

        let decode_number = self.tracker.record(params.picture_index);
        self.decode_picture_count += 1;
        log::debug!(
            "Decoding picture {} into surface {}",
            decode_number,
            params.picture_index
        );

        Ok(())
    }

    fn handle_display(&mut self, info: &DisplayInfo) -> Result<()> {
        if let Some(decode_number) = self.tracker.decode_number(info.picture_index) {
            log::debug!(
                "Displaying picture {} from surface {}",
                decode_number,
                info.picture_index
            );
        }

        let (decoder, format) = match (self.provisioner.decoder(), self.format.as_ref()) {
            (Some(decoder), Some(format)) => (decoder, format),
            _ => return Err(DecodeError::NotConfigured),
        };

        let proc_params = ProcParams {
            progressive_frame: info.progressive_frame,
            top_field_first: info.top_field_first,
            second_field: false,
            output_stream: self.config.output_stream,
        };
        let pitch = self.frame_pitch;
        let provisioner = &mut self.provisioner;
        let post_processor = &mut self.post_processor;

        self.ring
            .push_with(info.timestamp, info.picture_index, |dst| {
                let surface = backend_call!(provisioner.backend_mut().map_frame(
                    decoder,
                    info.picture_index,
                    &proc_params
                ))?;
                let processed = post_processor.process(&surface, dst, pitch, format);
                backend_call!(provisioner.backend_mut().unmap_frame(decoder, surface))?;
                processed?;

                Ok(())
            })?;
        self.decoded_frame_count += 1;

        Ok(())
    }

    /// Queues the picture that previously ran out of frame slots, if any.
    fn retry_deferred_display(&mut self) -> Result<()> {
        let Some(info) = self.deferred_display.take() else {
            return Ok(());
        };

        log::debug!("Retrying display of surface {}", info.picture_index);
        let result = self.handle_display(&info);
        match &result {
            Err(DecodeError::OutOfFrameSlots { .. }) => self.deferred_display = Some(info),
            Err(e) if e.is_fatal() => self.poison(e),
            _ => (),
        }

        result
    }

    fn unlock_borrowed(&mut self) {
        self.borrowed.drain(..).for_each(FrameLease::unlock);
    }
}

impl<B: DecoderBackend> ParserCallbacks for SessionCore<B> {
    fn on_sequence(&mut self, format: &RawVideoFormat) -> SequenceResponse {
        match self.handle_sequence(format) {
            Ok(pool_size) if pool_size > 1 => SequenceResponse::PoolSize(pool_size),
            Ok(_) => SequenceResponse::Accept,
            Err(e) => {
                self.set_error(e);
                SequenceResponse::Reject
            }
        }
    }

    fn on_decode(&mut self, params: &PictureParams) -> bool {
        match self.handle_decode(params) {
            Ok(()) => true,
            Err(e) => {
                self.set_error(e);
                false
            }
        }
    }

    fn on_display(&mut self, info: Option<&DisplayInfo>) -> bool {
        let Some(info) = info else {
            log::debug!("End of stream reached");
            self.end_of_stream = true;
            return true;
        };

        match self.handle_display(info) {
            Ok(()) => true,
            Err(e) => {
                if let DecodeError::OutOfFrameSlots { .. } = e {
                    self.deferred_display = Some(info.clone());
                }
                self.set_error(e);
                false
            }
        }
    }
}

impl<B: DecoderBackend> Drop for SessionCore<B> {
    fn drop(&mut self) {
        self.unlock_borrowed();
        if let Some(info) = self.deferred_display.take() {
            log::debug!("Dropping undelivered picture from surface {}", info.picture_index);
        }
        let discarded = self.ring.discard_ready();
        if discarded > 0 {
            log::debug!("Discarded {} undelivered frames", discarded);
        }
        if let Err(e) = self.provisioner.destroy() {
            log::warn!("Failed to destroy decoder: {}", e);
        }
    }
}

/// A decoding session for one stream.
///
/// `B` is the decode driver and `P` the bitstream parser driving it.
pub struct Session<B: DecoderBackend, P: VideoParser> {
    parser: P,
    core: SessionCore<B>,
}

impl<B: DecoderBackend, P: VideoParser> Session<B, P> {
    pub fn new(config: SessionConfig, backend: B) -> Result<Self> {
        let mut reconfig = ReconfigController::default();
        reconfig.set(ReconfigParams::new(config.crop, config.resize))?;

        let parser = P::new(&config.parser_params())?;
        let configured_max = Resolution::from((config.max_width, config.max_height));

        Ok(Self {
            parser,
            core: SessionCore {
                provisioner: SurfaceProvisioner::new(backend, configured_max),
                reconfig,
                tracker: DecodeOrderTracker::new(config.decode_history),
                ring: FrameRing::new(config.backpressure),
                post_processor: Box::new(PlaneCopy::new(config.output_format)),
                format: None,
                pool_size: 0,
                frame_pitch: 0,
                callback_error: None,
                deferred_display: None,
                borrowed: Vec::new(),
                poisoned: None,
                decode_picture_count: 0,
                decoded_frame_count: 0,
                end_of_stream: false,
                config,
            },
        })
    }

    /// Decodes `bitstream` and returns the frames that became ready for display, in display
    /// order.
    ///
    /// An empty `bitstream` signals the end of the stream: all pending frames are flushed.
    /// Frames that became ready before an error are kept and returned by the next successful
    /// call, or by [`Session::take_frames`].
    ///
    /// A picture that could not be queued because every frame slot was taken is queued first.
    /// If there is still no free slot, [`DecodeError::OutOfFrameSlots`] is returned and
    /// `bitstream` is not consumed.
    pub fn decode(
        &mut self,
        bitstream: &[u8],
        flags: PacketFlags,
        timestamp: i64,
    ) -> Result<Vec<FrameLease>> {
        self.core.check_poisoned()?;
        self.core.unlock_borrowed();
        self.core.retry_deferred_display()?;

        let mut flags = flags | PacketFlags::TIMESTAMP;
        if bitstream.is_empty() {
            flags |= PacketFlags::END_OF_STREAM;
        }
        if self.core.config.low_latency {
            flags |= PacketFlags::END_OF_PICTURE;
        }
        if !bitstream.is_empty() {
            self.core.end_of_stream = false;
        }

        let packet = BitstreamPacket {
            payload: bitstream,
            timestamp,
            flags,
        };
        let parsed = self.parser.parse(&packet, &mut self.core);

        let result = match (self.core.callback_error.take(), parsed) {
            (Some(e), _) => Err(e),
            (None, Err(e)) => Err(DecodeError::from(e)),
            (None, Ok(())) => Ok(()),
        };
        if let Err(e) = result {
            if e.is_fatal() {
                self.core.poison(&e);
            }
            return Err(e);
        }

        if flags.contains(PacketFlags::END_OF_STREAM) {
            self.core.end_of_stream = true;
        }

        Ok(self.core.ring.drain())
    }

    /// Decodes `bitstream` like [`Session::decode`], but the session keeps ownership of the
    /// returned frames. They are unlocked automatically by the next decode call, so they cannot
    /// be kept across it.
    pub fn decode_borrowed(
        &mut self,
        bitstream: &[u8],
        flags: PacketFlags,
        timestamp: i64,
    ) -> Result<&[FrameLease]> {
        self.core.borrowed = self.decode(bitstream, flags, timestamp)?;
        Ok(&self.core.borrowed)
    }

    /// Signals the end of the stream and returns all remaining frames.
    pub fn flush(&mut self) -> Result<Vec<FrameLease>> {
        self.decode(&[], PacketFlags::END_OF_STREAM | PacketFlags::NOTIFY_EOS, 0)
    }

    /// Returns the frames that are ready but have not been handed out because of an error.
    /// Works on poisoned sessions too.
    pub fn take_frames(&mut self) -> Vec<FrameLease> {
        self.core.ring.drain()
    }

    /// Gives the slots of `frames` back to the session.
    pub fn unlock_frames<I: IntoIterator<Item = FrameLease>>(&self, frames: I) {
        frames.into_iter().for_each(FrameLease::unlock);
    }

    /// Changes the output crop region and size.
    ///
    /// Before the first sequence header, the parameters are only recorded. Afterwards, the
    /// decoder is reconfigured in place, which fails if the new output does not fit in the
    /// bounds the decoder was created with. The session stays usable in that case.
    pub fn set_reconfig_params(
        &mut self,
        crop: Option<Rect>,
        resize: Option<Resolution>,
    ) -> Result<()> {
        self.core.check_poisoned()?;
        self.core.retry_deferred_display()?;
        let params = ReconfigParams::new(crop, resize);
        let core = &mut self.core;

        let (active, limits) = match (core.format.as_ref(), core.provisioner.limits()) {
            (Some(active), Some(limits)) => (active, limits),
            _ => return core.reconfig.set(params),
        };

        let desc = core.reconfig.apply(params, active, &limits)?;
        if let Err(e) = core.provisioner.reconfigure(&desc) {
            if e.is_fatal() {
                core.poison(&e);
            }
            return Err(e);
        }
        core.activate(desc);

        Ok(())
    }

    /// Replaces the post-processing applied to decoded surfaces.
    pub fn set_post_processor(&mut self, post_processor: Box<dyn PostProcessor>) {
        self.core.post_processor = post_processor;
    }

    /// Format of the stream being decoded.
    pub fn video_format(&self) -> Result<&VideoFormatDescriptor> {
        self.core.format.as_ref().ok_or(DecodeError::NotConfigured)
    }

    /// Output width in pixels.
    pub fn width(&self) -> Result<u32> {
        Ok(self.video_format()?.width())
    }

    /// Output luma height in pixels.
    pub fn height(&self) -> Result<u32> {
        Ok(self.video_format()?.luma_height())
    }

    pub fn chroma_height(&self) -> Result<u32> {
        Ok(self.video_format()?.chroma_height())
    }

    pub fn num_chroma_planes(&self) -> Result<u32> {
        Ok(self.video_format()?.num_chroma_planes())
    }

    pub fn bit_depth(&self) -> Result<u32> {
        Ok(self.video_format()?.bit_depth())
    }

    pub fn bytes_per_pixel(&self) -> Result<u32> {
        Ok(self.video_format()?.bytes_per_pixel())
    }

    /// Size in bytes of the frame data, without row padding.
    pub fn frame_size(&self) -> Result<usize> {
        Ok(self.video_format()?.frame_size())
    }

    /// Distance in bytes between two rows of the output frames.
    pub fn device_frame_pitch(&self) -> Result<usize> {
        self.video_format()?;
        Ok(self.core.frame_pitch)
    }

    /// Format of the decode surfaces.
    pub fn surface_format(&self) -> Result<SurfaceFormat> {
        Ok(self.video_format()?.surface_format())
    }

    pub fn output_format(&self) -> OutputFormat {
        self.core.config.output_format
    }

    /// Human readable description of the stream and decoding parameters.
    pub fn video_info(&self) -> Result<String> {
        Ok(self.video_format()?.video_info(self.core.pool_size))
    }

    /// Number of decode surfaces of the current decoder.
    pub fn num_decode_surfaces(&self) -> Result<u32> {
        self.video_format()?;
        Ok(self.core.pool_size)
    }

    pub fn reconfig_params(&self) -> ReconfigParams {
        self.core.reconfig.params()
    }

    /// Number of frames queued for the client so far.
    pub fn decoded_frame_count(&self) -> u64 {
        self.core.decoded_frame_count
    }

    /// Number of pictures submitted for decoding so far.
    pub fn decode_picture_count(&self) -> u64 {
        self.core.decode_picture_count
    }

    /// Number of decoder instances created so far.
    pub fn provision_count(&self) -> u32 {
        self.core.provisioner.provision_count()
    }

    /// Number of in-place decoder reconfigurations so far.
    pub fn reconfigure_count(&self) -> u32 {
        self.core.provisioner.reconfigure_count()
    }

    /// Recent history of the pictures submitted for decoding.
    pub fn decode_order(&self) -> &DecodeOrderTracker {
        &self.core.tracker
    }

    pub fn frame_ring(&self) -> &FrameRing {
        &self.core.ring
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.core.end_of_stream
    }

    pub fn is_poisoned(&self) -> bool {
        self.core.poisoned.is_some()
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    pub fn backend(&self) -> &B {
        self.core.provisioner.backend()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        self.core.provisioner.backend_mut()
    }
}
