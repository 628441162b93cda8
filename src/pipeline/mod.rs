//! Composable Decode Pipe Graph
//!
//! A pipeline is a chain of pipes, leaf first: each pipe owns its downstream
//! base and forwards control calls (`setup`, `cleanup`, `poll_request_idr`)
//! through the chain. Payloads are tagged by kind so only compatible
//! neighbors compose; the builder checks kinds when it assembles a chain.

pub mod audio;
pub mod builder;
pub mod convert;
pub mod fmp4;
pub mod hw_decoder;
pub mod sw_decoder;
pub mod worker;

pub use audio::{AudioDecoderPipe, PcmSink};
pub use builder::{
    build_audio_pipeline, build_pipeline, BuildContext, BuiltPipeline, EnvCaps, OutputKind,
    RendererSpec,
};
pub use convert::YuvToRgbaPipe;
pub use fmp4::{
    Fmp4EmitterPipe, MediaSegment, SegmentKind, SourceBufferEvent, SourceBufferHandle,
    SourceBufferSink,
};
pub use hw_decoder::HardwareDecoderPipe;
pub use sw_decoder::SoftwareDecoderPipe;
pub use worker::WorkerPipe;

use crate::error::PipelineError;
use crate::media::{
    AudioPacket, DecodedFrame, EncodedUnit, PcmBlock, RgbaVideoFrame, StreamConfig,
    VideoFormat, Yuv420VideoFrame,
};

/// What a pipe consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    EncodedVideo,
    DecodedFrame,
    Yuv420,
    Rgba,
    Segment,
    EncodedAudio,
    Pcm,
}

/// A unit of work moving down the chain.
#[derive(Debug)]
pub enum PipePayload {
    EncodedVideo(EncodedUnit),
    DecodedFrame(DecodedFrame),
    Yuv420(Yuv420VideoFrame),
    Rgba(RgbaVideoFrame),
    Segment(fmp4::MediaSegment),
    EncodedAudio(AudioPacket),
    Pcm(PcmBlock),
}

impl PipePayload {
    pub fn kind(&self) -> StreamKind {
        match self {
            PipePayload::EncodedVideo(_) => StreamKind::EncodedVideo,
            PipePayload::DecodedFrame(_) => StreamKind::DecodedFrame,
            PipePayload::Yuv420(_) => StreamKind::Yuv420,
            PipePayload::Rgba(_) => StreamKind::Rgba,
            PipePayload::Segment(_) => StreamKind::Segment,
            PipePayload::EncodedAudio(_) => StreamKind::EncodedAudio,
            PipePayload::Pcm(_) => StreamKind::Pcm,
        }
    }
}

/// Whether a backend can handle a codec, as far as can be known statically.
/// `Maybe` commits only after a setup probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Yes,
    No,
    Maybe,
}

/// Static capability answer for one pipe.
#[derive(Debug, Clone)]
pub struct PipeInfo {
    pub environment_supported: bool,
    /// `None` when the pipe has no codec opinion (converters, sinks).
    pub supported_video_codecs: Option<fn(VideoFormat) -> Support>,
}

impl PipeInfo {
    pub fn support_for(&self, format: VideoFormat) -> Support {
        match self.supported_video_codecs {
            Some(lookup) => lookup(format),
            None => Support::Yes,
        }
    }
}

/// Pipe lifecycle: unconfigured until `setup` succeeds, cleaned after
/// `cleanup`. Submissions before configuration are buffered by pipes that
/// can, submissions after cleanup are dropped silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeState {
    #[default]
    Unconfigured,
    Configured,
    Errored,
    Cleaned,
}

/// A composable pipeline node.
///
/// `submit` must return promptly: it may hand work to a background thread
/// but never blocks on it. `setup` is the only operation allowed to take
/// its time.
pub trait Pipe: Send {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError>;

    fn submit(&mut self, payload: PipePayload);

    /// True when this pipe (or anything downstream) wants a fresh IDR.
    fn poll_request_idr(&mut self) -> bool {
        false
    }

    /// Tear down, cascading to the base. Post-order: a pipe releases its own
    /// resources first, then forwards.
    fn cleanup(&mut self);
}
