// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! simdec, a decoding session driven by the simulated parser and backend. Generates a synthetic
//! stream, decodes it, and can compute MD5 checksums of the output or write the raw decoded
//! frames to a file.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;
use hwdec_session::backend::sim::SimBackend;
use hwdec_session::frame_ring::BackpressurePolicy;
use hwdec_session::frame_ring::FrameLease;
use hwdec_session::parser::sim::simple_format;
use hwdec_session::parser::sim::SimPacketBuilder;
use hwdec_session::parser::sim::SimParser;
use hwdec_session::parser::PacketFlags;
use hwdec_session::session::Session;
use hwdec_session::session::SessionConfig;
use hwdec_session::ChromaFormat;
use hwdec_session::OutputFormat;
use hwdec_session::Resolution;
use hwdec_session::VideoCodec;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum EncodedFormat {
    H264,
    H265,
    VP9,
    AV1,
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(EncodedFormat::H264),
            "h265" | "H265" => Ok(EncodedFormat::H265),
            "vp9" | "VP9" => Ok(EncodedFormat::VP9),
            "av1" | "AV1" => Ok(EncodedFormat::AV1),
            _ => Err("unrecognized input format. Valid values: h264, h265, vp9, av1"),
        }
    }
}

impl From<EncodedFormat> for VideoCodec {
    fn from(format: EncodedFormat) -> Self {
        match format {
            EncodedFormat::H264 => VideoCodec::H264,
            EncodedFormat::H265 => VideoCodec::Hevc,
            EncodedFormat::VP9 => VideoCodec::Vp9,
            EncodedFormat::AV1 => VideoCodec::Av1,
        }
    }
}

#[derive(Debug)]
enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Decodes a synthetic stream with the simulated hardware
#[derive(Debug, FromArgs)]
struct Args {
    /// output file to write the decoded frames to
    #[argh(option)]
    output: Option<PathBuf>,

    /// codec of the synthetic stream. Default: h264
    #[argh(option, default = "EncodedFormat::H264")]
    input_format: EncodedFormat,

    /// number of pictures in the stream. Default: 30
    #[argh(option, default = "30")]
    frames: u32,

    /// coded width of the stream. Default: 320
    #[argh(option, default = "320")]
    width: u32,

    /// coded height of the stream. Default: 240
    #[argh(option, default = "240")]
    height: u32,

    /// picture at which the stream switches to twice its coded size
    #[argh(option)]
    upscale_at: Option<u32>,

    /// largest coded width to reconfigure to without recreating the decoder
    #[argh(option, default = "0")]
    max_width: u32,

    /// largest coded height to reconfigure to without recreating the decoder
    #[argh(option, default = "0")]
    max_height: u32,

    /// width to scale the output to. Requires "resize-height" to be set.
    #[argh(option)]
    resize_width: Option<u32>,

    /// height to scale the output to. Requires "resize-width" to be set.
    #[argh(option)]
    resize_height: Option<u32>,

    /// layout of the output frames (semiplanar or planar). Default: semiplanar
    #[argh(option, default = "OutputFormat::SemiPlanar")]
    output_format: OutputFormat,

    /// what to do when every frame slot is taken (block or fail). Default: block
    #[argh(option, default = "BackpressurePolicy::default()")]
    backpressure: BackpressurePolicy,

    /// display pictures as soon as they are decoded
    #[argh(switch)]
    low_latency: bool,

    /// let the session unlock the frames of each decode call on the next one
    #[argh(switch)]
    borrowed: bool,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    compute_md5: Option<Md5Computation>,
}

/// Number of decode surfaces the synthetic stream asks for.
const STREAM_SURFACES: u32 = 4;

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();
    let codec = VideoCodec::from(args.input_format);

    let mut output = args
        .output
        .as_ref()
        .map(|p| File::create(p).expect("error creating output file"));

    let resize = match (args.resize_width, args.resize_height) {
        (Some(width), Some(height)) => Some(Resolution::from((width, height))),
        (None, None) => None,
        _ => panic!("resize-width and resize-height must be set together"),
    };

    let config = SessionConfig {
        codec,
        output_format: args.output_format,
        low_latency: args.low_latency,
        resize,
        max_width: args.max_width,
        max_height: args.max_height,
        backpressure: args.backpressure,
        ..Default::default()
    };
    let mut session = Session::<SimBackend, SimParser>::new(config, SimBackend::default())
        .expect("failed to create session");

    let small = simple_format(
        codec,
        Resolution::from((args.width, args.height)),
        ChromaFormat::Yuv420,
        0,
        STREAM_SURFACES,
    );
    let large = simple_format(
        codec,
        Resolution::from((args.width * 2, args.height * 2)),
        ChromaFormat::Yuv420,
        0,
        STREAM_SURFACES,
    );

    let mut md5_context = md5::Context::new();
    let mut on_new_frames = |frames: &[FrameLease]| {
        for frame in frames {
            log::debug!(
                "Frame {} (surface {}, crc {:08x})",
                frame.timestamp(),
                frame.picture_index(),
                frame.checksum()
            );

            if let Some(output) = &mut output {
                output
                    .write_all(frame.data())
                    .expect("failed to write to output file");
            }

            match args.compute_md5 {
                None => (),
                Some(Md5Computation::Frame) => println!("{:x}", md5::compute(frame.data())),
                Some(Md5Computation::Stream) => md5_context.consume(frame.data()),
            }
        }
    };

    for i in 0..args.frames {
        let header = match args.upscale_at {
            Some(at) if i >= at => &large,
            _ => &small,
        };
        let index = i % STREAM_SURFACES;
        let packet = SimPacketBuilder::new()
            .sequence(header)
            .picture(index, index == 0)
            .display(index, None)
            .build();

        if args.borrowed {
            let frames = session
                .decode_borrowed(&packet, PacketFlags::NONE, i as i64)
                .expect("decoding failed");
            on_new_frames(frames);
        } else {
            let frames = session
                .decode(&packet, PacketFlags::NONE, i as i64)
                .expect("decoding failed");
            on_new_frames(&frames);
            session.unlock_frames(frames);
        }
    }

    let frames = session.flush().expect("flushing failed");
    on_new_frames(&frames);
    session.unlock_frames(frames);

    if let Ok(info) = session.video_info() {
        log::info!("{}", info);
    }
    log::info!(
        "Decoded {} frames, {} decoder(s) created, {} reconfiguration(s)",
        session.decoded_frame_count(),
        session.provision_count(),
        session.reconfigure_count()
    );

    if let Some(Md5Computation::Stream) = args.compute_md5 {
        println!("{:x}", md5_context.compute());
    }
}
