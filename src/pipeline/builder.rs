//! Pipeline Builder
//!
//! Enumerates candidate pipe chains in fixed preference order and selects
//! the first whose every link is supported in the current environment and
//! covers at least one requested codec. Ties break positionally: earlier in
//! the table wins.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::mpsc;

use super::audio::{AudioDecoderPipe, PcmSink};
use super::convert::YuvToRgbaPipe;
use super::fmp4::{Fmp4EmitterPipe, SourceBufferEvent, SourceBufferHandle, SourceBufferSink};
use super::hw_decoder::HardwareDecoderPipe;
use super::sw_decoder::SoftwareDecoderPipe;
use super::worker::WorkerPipe;
use super::{Pipe, PipeInfo, StreamKind, Support};
use crate::error::PipelineError;
use crate::media::{RgbaVideoFrame, VideoFormat, Yuv420VideoFrame};
use crate::render::{FrameSlot, GpuYuvSink, PresentCallback, RgbaSink};

/// Where the pipeline's output lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Frames presented on the display surface.
    VideoTrack,
    /// A synthesized data stream handed to an external consumer.
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeSpec {
    HardwareDecoder,
    SoftwareDecoder,
    Fmp4Emitter,
    YuvToRgba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererSpec {
    GpuYuv,
    RgbaBuffer,
    MediaSource,
}

struct CandidateChain {
    name: &'static str,
    output: OutputKind,
    /// Run the whole chain on a background thread.
    worker: bool,
    pipes: &'static [PipeSpec],
    renderer: RendererSpec,
}

/// Preference-ordered candidate table; immutable process-wide data.
static CANDIDATE_CHAINS: &[CandidateChain] = &[
    CandidateChain {
        name: "hw-decode/gpu-yuv/worker",
        output: OutputKind::VideoTrack,
        worker: true,
        pipes: &[PipeSpec::HardwareDecoder],
        renderer: RendererSpec::GpuYuv,
    },
    CandidateChain {
        name: "hw-decode/gpu-yuv",
        output: OutputKind::VideoTrack,
        worker: false,
        pipes: &[PipeSpec::HardwareDecoder],
        renderer: RendererSpec::GpuYuv,
    },
    CandidateChain {
        name: "hw-decode/rgba",
        output: OutputKind::VideoTrack,
        worker: false,
        pipes: &[PipeSpec::HardwareDecoder, PipeSpec::YuvToRgba],
        renderer: RendererSpec::RgbaBuffer,
    },
    CandidateChain {
        name: "sw-decode/gpu-yuv/worker",
        output: OutputKind::VideoTrack,
        worker: true,
        pipes: &[PipeSpec::SoftwareDecoder],
        renderer: RendererSpec::GpuYuv,
    },
    CandidateChain {
        name: "sw-decode/rgba",
        output: OutputKind::VideoTrack,
        worker: false,
        pipes: &[PipeSpec::SoftwareDecoder, PipeSpec::YuvToRgba],
        renderer: RendererSpec::RgbaBuffer,
    },
    CandidateChain {
        name: "fmp4/media-source",
        output: OutputKind::VideoTrack,
        worker: false,
        pipes: &[PipeSpec::Fmp4Emitter],
        renderer: RendererSpec::MediaSource,
    },
    CandidateChain {
        name: "fmp4/data",
        output: OutputKind::Data,
        worker: false,
        pipes: &[PipeSpec::Fmp4Emitter],
        renderer: RendererSpec::MediaSource,
    },
];

impl PipeSpec {
    fn input_kinds(&self) -> &'static [StreamKind] {
        match self {
            PipeSpec::HardwareDecoder | PipeSpec::SoftwareDecoder | PipeSpec::Fmp4Emitter => {
                &[StreamKind::EncodedVideo]
            }
            PipeSpec::YuvToRgba => &[StreamKind::DecodedFrame, StreamKind::Yuv420],
        }
    }

    fn output_kind(&self) -> StreamKind {
        match self {
            PipeSpec::HardwareDecoder => StreamKind::DecodedFrame,
            PipeSpec::SoftwareDecoder => StreamKind::Yuv420,
            PipeSpec::Fmp4Emitter => StreamKind::Segment,
            PipeSpec::YuvToRgba => StreamKind::Rgba,
        }
    }
}

impl RendererSpec {
    fn input_kinds(&self) -> &'static [StreamKind] {
        match self {
            RendererSpec::GpuYuv => &[StreamKind::DecodedFrame, StreamKind::Yuv420],
            RendererSpec::RgbaBuffer => &[StreamKind::Rgba],
            RendererSpec::MediaSource => &[StreamKind::Segment],
        }
    }
}

/// A chain composes when every producer's output kind is accepted by the
/// next consumer.
fn chain_kinds_compose(chain: &CandidateChain) -> bool {
    let Some(first) = chain.pipes.first() else {
        return false;
    };
    if !first.input_kinds().contains(&StreamKind::EncodedVideo) {
        return false;
    }
    for pair in chain.pipes.windows(2) {
        if !pair[1].input_kinds().contains(&pair[0].output_kind()) {
            return false;
        }
    }
    let last = chain.pipes.last().unwrap_or(first);
    chain.renderer.input_kinds().contains(&last.output_kind())
}

/// Capability answers for the current environment, injectable for tests.
#[derive(Debug, Clone)]
pub struct EnvCaps {
    pub hardware_decoder: bool,
    pub software_decoder: bool,
    pub gpu_surface: bool,
    pub media_source: bool,
}

impl EnvCaps {
    pub fn detect(ctx: &BuildContext) -> Self {
        Self {
            hardware_decoder: HardwareDecoderPipe::environment_supported(),
            software_decoder: true,
            gpu_surface: crate::render::gpu_available(),
            media_source: ctx.segment_tx.is_some(),
        }
    }
}

/// Resources the instantiated chain renders into.
pub struct BuildContext {
    pub yuv_slot: Arc<FrameSlot<Yuv420VideoFrame>>,
    pub rgba_slot: Arc<FrameSlot<RgbaVideoFrame>>,
    pub present: Option<PresentCallback>,
    pub segment_tx: Option<mpsc::UnboundedSender<SourceBufferEvent>>,
    /// Policy knob: deny 4:4:4 H.264 decode even where reported capable.
    pub disable_high444_decode: bool,
    /// Prune the table to chains ending in this renderer.
    pub forced_renderer: Option<RendererSpec>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self {
            yuv_slot: Arc::new(FrameSlot::new()),
            rgba_slot: Arc::new(FrameSlot::new()),
            present: None,
            segment_tx: None,
            disable_high444_decode: false,
            forced_renderer: None,
        }
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The selected chain, ready for `setup`.
pub struct BuiltPipeline {
    pub head: Box<dyn Pipe>,
    /// Codecs every link in the chain can carry.
    pub formats: Vec<VideoFormat>,
    pub chain_name: &'static str,
    /// Present when the chain terminates in a source buffer.
    pub source_buffer: Option<SourceBufferHandle>,
}

impl std::fmt::Debug for BuiltPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltPipeline")
            .field("formats", &self.formats)
            .field("chain_name", &self.chain_name)
            .finish_non_exhaustive()
    }
}

fn pipe_info(spec: PipeSpec, env: &EnvCaps) -> PipeInfo {
    match spec {
        PipeSpec::HardwareDecoder => PipeInfo {
            environment_supported: env.hardware_decoder,
            supported_video_codecs: Some(HardwareDecoderPipe::format_support),
        },
        PipeSpec::SoftwareDecoder => PipeInfo {
            environment_supported: env.software_decoder,
            supported_video_codecs: Some(SoftwareDecoderPipe::format_support),
        },
        PipeSpec::Fmp4Emitter => PipeInfo {
            environment_supported: true,
            supported_video_codecs: Some(fmp4_format_support),
        },
        PipeSpec::YuvToRgba => PipeInfo {
            environment_supported: true,
            supported_video_codecs: None,
        },
    }
}

/// The fragmented stream carries an `avcC` sample entry; plain H.264 only.
fn fmp4_format_support(format: VideoFormat) -> Support {
    match format {
        VideoFormat::H264 => Support::Yes,
        _ => Support::No,
    }
}

fn renderer_supported(spec: RendererSpec, env: &EnvCaps) -> bool {
    match spec {
        RendererSpec::GpuYuv => env.gpu_surface,
        RendererSpec::RgbaBuffer => true,
        RendererSpec::MediaSource => env.media_source,
    }
}

/// Select and instantiate the best viable chain.
///
/// Deterministic: fixed capability answers and preferences always yield the
/// same chain.
pub fn build_pipeline(
    output: OutputKind,
    requested: &[VideoFormat],
    env: &EnvCaps,
    ctx: &BuildContext,
) -> Result<BuiltPipeline, PipelineError> {
    let requested: Vec<VideoFormat> = requested
        .iter()
        .copied()
        .filter(|format| {
            !(ctx.disable_high444_decode && *format == VideoFormat::H264High8_444)
        })
        .collect();

    'chains: for chain in CANDIDATE_CHAINS {
        if chain.output != output {
            continue;
        }
        if let Some(forced) = ctx.forced_renderer {
            if chain.renderer != forced {
                continue;
            }
        }
        debug_assert!(chain_kinds_compose(chain), "mismatched chain {}", chain.name);

        if !renderer_supported(chain.renderer, env) {
            debug!("chain {}: renderer unsupported", chain.name);
            continue;
        }

        // Intersect every pipe's codec mask with the running one.
        let mut formats = requested.clone();
        for spec in chain.pipes {
            let info = pipe_info(*spec, env);
            if !info.environment_supported {
                debug!("chain {}: {spec:?} unsupported", chain.name);
                continue 'chains;
            }
            formats.retain(|format| info.support_for(*format) != Support::No);
            if formats.is_empty() {
                debug!("chain {}: no codec survives {spec:?}", chain.name);
                continue 'chains;
            }
        }

        // Instantiate bottom-up: renderer first, then each pipe bound to
        // the one below it.
        let mut source_buffer = None;
        let mut current: Box<dyn Pipe> = match chain.renderer {
            RendererSpec::GpuYuv => Box::new(GpuYuvSink::new(
                ctx.yuv_slot.clone(),
                ctx.present.clone(),
            )),
            RendererSpec::RgbaBuffer => Box::new(RgbaSink::new(
                ctx.rgba_slot.clone(),
                ctx.present.clone(),
            )),
            RendererSpec::MediaSource => {
                let tx = ctx
                    .segment_tx
                    .clone()
                    .ok_or(PipelineError::Unsupported("no segment consumer"))?;
                let (sink, handle) = SourceBufferSink::new(tx);
                source_buffer = Some(handle);
                Box::new(sink)
            }
        };

        for spec in chain.pipes.iter().rev() {
            current = match spec {
                PipeSpec::HardwareDecoder => Box::new(HardwareDecoderPipe::new(current)),
                PipeSpec::SoftwareDecoder => Box::new(SoftwareDecoderPipe::new(current)),
                PipeSpec::Fmp4Emitter => {
                    Box::new(Fmp4EmitterPipe::new(current, formats[0]))
                }
                PipeSpec::YuvToRgba => Box::new(YuvToRgbaPipe::new(current)),
            };
        }

        if chain.worker {
            current = Box::new(WorkerPipe::new(current));
        }

        info!(
            "selected pipeline {} covering {:?}",
            chain.name,
            formats.iter().map(|f| f.display_name()).collect::<Vec<_>>()
        );
        return Ok(BuiltPipeline {
            head: current,
            formats,
            chain_name: chain.name,
            source_buffer,
        });
    }

    Err(PipelineError::NoPipeline)
}

/// The audio chain has a single shape: Opus decode into the PCM sink.
pub fn build_audio_pipeline() -> Result<Box<dyn Pipe>, PipelineError> {
    if !PcmSink::environment_supported() {
        return Err(PipelineError::Unsupported("no audio output device"));
    }
    Ok(Box::new(AudioDecoderPipe::new(Box::new(PcmSink::new()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(hw: bool, gpu: bool, mse: bool) -> EnvCaps {
        EnvCaps {
            hardware_decoder: hw,
            software_decoder: true,
            gpu_surface: gpu,
            media_source: mse,
        }
    }

    fn ctx_with_consumer() -> BuildContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        // The receiver is dropped; fine for selection tests.
        BuildContext {
            segment_tx: Some(tx),
            ..BuildContext::new()
        }
    }

    #[test]
    fn test_every_candidate_chain_composes() {
        for chain in CANDIDATE_CHAINS {
            assert!(chain_kinds_compose(chain), "chain {} mismatched", chain.name);
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let env = caps(true, true, false);
        let ctx = BuildContext::new();
        let requested = [VideoFormat::H264, VideoFormat::H265];

        let first =
            build_pipeline(OutputKind::VideoTrack, &requested, &env, &ctx).unwrap();
        for _ in 0..5 {
            let again =
                build_pipeline(OutputKind::VideoTrack, &requested, &env, &ctx).unwrap();
            assert_eq!(again.chain_name, first.chain_name);
            assert_eq!(again.formats, first.formats);
        }
        assert_eq!(first.chain_name, "hw-decode/gpu-yuv/worker");
    }

    #[test]
    fn test_falls_back_to_software_without_hardware() {
        let env = caps(false, true, false);
        let ctx = BuildContext::new();
        let built =
            build_pipeline(OutputKind::VideoTrack, &[VideoFormat::H264], &env, &ctx).unwrap();
        assert_eq!(built.chain_name, "sw-decode/gpu-yuv/worker");
        assert_eq!(built.formats, vec![VideoFormat::H264]);
    }

    #[test]
    fn test_software_cannot_carry_h265() {
        let env = caps(false, true, false);
        let ctx = BuildContext::new();
        let err = build_pipeline(OutputKind::VideoTrack, &[VideoFormat::H265], &env, &ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoPipeline));
    }

    #[test]
    fn test_no_gpu_prefers_rgba_conversion() {
        let env = caps(true, false, false);
        let ctx = BuildContext::new();
        let built =
            build_pipeline(OutputKind::VideoTrack, &[VideoFormat::H264], &env, &ctx).unwrap();
        assert_eq!(built.chain_name, "hw-decode/rgba");
    }

    #[test]
    fn test_media_source_fallback_is_last() {
        let env = caps(false, false, true);
        let ctx = ctx_with_consumer();
        let built =
            build_pipeline(OutputKind::VideoTrack, &[VideoFormat::H264], &env, &ctx).unwrap();
        // Software decode to RGBA still outranks the media-source path.
        assert_eq!(built.chain_name, "sw-decode/rgba");

        let built = build_pipeline(OutputKind::Data, &[VideoFormat::H264], &env, &ctx).unwrap();
        assert_eq!(built.chain_name, "fmp4/data");
        assert!(built.source_buffer.is_some());
    }

    #[test]
    fn test_forced_renderer_prunes_table() {
        let env = caps(true, true, true);
        let mut ctx = ctx_with_consumer();
        ctx.forced_renderer = Some(RendererSpec::MediaSource);
        let built =
            build_pipeline(OutputKind::VideoTrack, &[VideoFormat::H264], &env, &ctx).unwrap();
        assert_eq!(built.chain_name, "fmp4/media-source");
    }

    #[test]
    fn test_high444_policy_knob() {
        let env = caps(true, true, false);
        let mut ctx = BuildContext::new();
        ctx.disable_high444_decode = true;
        let built = build_pipeline(
            OutputKind::VideoTrack,
            &[VideoFormat::H264High8_444, VideoFormat::H264],
            &env,
            &ctx,
        )
        .unwrap();
        assert_eq!(built.formats, vec![VideoFormat::H264]);

        // Only the denied format requested: nothing can be built.
        let err = build_pipeline(
            OutputKind::VideoTrack,
            &[VideoFormat::H264High8_444],
            &env,
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::NoPipeline));
    }

    #[test]
    fn test_data_output_requires_consumer() {
        let env = caps(true, true, false);
        let ctx = BuildContext::new();
        let err =
            build_pipeline(OutputKind::Data, &[VideoFormat::H264], &env, &ctx).unwrap_err();
        assert!(matches!(err, PipelineError::NoPipeline));
    }
}
