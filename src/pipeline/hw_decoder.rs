//! Hardware Video Decoder Pipe
//!
//! Wraps an FFmpeg decoder, hardware backends first. One decoder instance is
//! bound to the current description at a time; reconfiguration coalesces
//! with IDR arrival, and queue pressure turns into an IDR request.
//!
//! Decoding runs on a dedicated thread: per-unit submission stays prompt and
//! the FFmpeg context never crosses threads after creation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{Pipe, PipePayload, PipeState, Support};
use crate::error::PipelineError;
use crate::media::{
    CodecFamily, DecodedFrame, DecoderConfig, EncodedUnit, StreamConfig, StreamTranslator,
    VideoFormat, Yuv420VideoFrame,
};

extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::{self, context::Context as CodecContext, decoder};
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as ScalerContext, flag::Flags as ScalerFlags};
use ffmpeg::util::frame::video::Video as FfmpegFrame;
use ffmpeg::Packet;

/// Queue delay above which a backlog is considered hopeless.
const IDR_DELAY_THRESHOLD_MS: f64 = 200.0;
/// Minimum backlog before the delay estimate is trusted.
const IDR_QUEUE_THRESHOLD: usize = 2;
/// Units parked before `setup` completes.
const PENDING_LIMIT: usize = 64;

enum DecoderCommand {
    /// Tear down the decoder and rebuild it against a new description.
    Configure(DecoderConfig),
    Decode {
        chunk: Bytes,
        timestamp_us: u64,
    },
    /// Rebuild the decoder and skip input until the next keyframe.
    Reset,
    Stop,
}

/// Everything needed to (re)build the bound decoder instance.
#[derive(Clone)]
struct DecoderFactory {
    codec_id: codec::Id,
    hw_name: Option<&'static str>,
    optimize_for_latency: bool,
}

impl DecoderFactory {
    fn build(&self, description: Option<&[u8]>) -> Result<decoder::Video, ffmpeg::Error> {
        let mut ctx = match self.hw_name {
            Some(name) => {
                let hw_codec = decoder::find_by_name(name).ok_or(ffmpeg::Error::DecoderNotFound)?;
                CodecContext::new_with_codec(hw_codec)
            }
            None => {
                let sw_codec =
                    decoder::find(self.codec_id).ok_or(ffmpeg::Error::DecoderNotFound)?;
                CodecContext::new_with_codec(sw_codec)
            }
        };
        ctx.set_threading(codec::threading::Config::count(4));
        if self.optimize_for_latency {
            unsafe {
                (*ctx.as_mut_ptr()).flags |= ffmpeg::ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
            }
        }
        if let Some(description) = description {
            apply_extradata(&mut ctx, description);
        }
        ctx.decoder().video()
    }
}

/// Hand the out-of-band description record to the codec context.
fn apply_extradata(ctx: &mut CodecContext, description: &[u8]) {
    unsafe {
        let avctx = ctx.as_mut_ptr();
        let size = description.len();
        let data = ffmpeg::ffi::av_mallocz(size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize)
            as *mut u8;
        if data.is_null() {
            return;
        }
        std::ptr::copy_nonoverlapping(description.as_ptr(), data, size);
        (*avctx).extradata = data;
        (*avctx).extradata_size = size as i32;
    }
}

fn codec_id_for(family: CodecFamily) -> codec::Id {
    match family {
        CodecFamily::H264 => codec::Id::H264,
        CodecFamily::H265 => codec::Id::HEVC,
        CodecFamily::Av1 => codec::Id::AV1,
    }
}

/// Hardware decoder names in preference order, NVIDIA first.
fn hw_decoder_names(family: CodecFamily) -> &'static [&'static str] {
    match family {
        CodecFamily::H264 => &["h264_cuvid", "h264_qsv", "h264_d3d11va", "h264_dxva2"],
        CodecFamily::H265 => &["hevc_cuvid", "hevc_qsv", "hevc_d3d11va", "hevc_dxva2"],
        CodecFamily::Av1 => &["av1_cuvid", "av1_qsv"],
    }
}

/// Decode pipe backed by the platform's FFmpeg build.
pub struct HardwareDecoderPipe {
    base: Arc<Mutex<Box<dyn Pipe>>>,
    state: PipeState,
    cmd_tx: Option<mpsc::Sender<DecoderCommand>>,
    translator: Option<StreamTranslator>,
    pending: VecDeque<EncodedUnit>,
    /// Units submitted but not yet finished by the decoder thread.
    queue_depth: Arc<AtomicUsize>,
    fps: u32,
    requested_idr: bool,
    request_pending: bool,
    awaiting_keyframe: bool,
}

impl HardwareDecoderPipe {
    pub fn new(base: Box<dyn Pipe>) -> Self {
        Self {
            base: Arc::new(Mutex::new(base)),
            state: PipeState::Unconfigured,
            cmd_tx: None,
            translator: None,
            pending: VecDeque::new(),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            fps: 60,
            requested_idr: false,
            request_pending: false,
            awaiting_keyframe: true,
        }
    }

    /// FFmpeg cannot answer codec support without opening a decoder.
    pub fn format_support(_format: VideoFormat) -> Support {
        Support::Maybe
    }

    pub fn environment_supported() -> bool {
        static FFMPEG_OK: once_cell::sync::OnceCell<bool> = once_cell::sync::OnceCell::new();
        *FFMPEG_OK.get_or_init(|| match ffmpeg::init() {
            Ok(()) => true,
            Err(err) => {
                warn!("ffmpeg unavailable: {err:?}");
                false
            }
        })
    }

    /// Run the configuration probes for one codec tag. The tag itself is
    /// fixed by the caller; the probes vary the acceleration preference.
    fn probe_sequence(family: CodecFamily, codec_tag: &str) -> Option<DecoderFactory> {
        let codec_id = codec_id_for(family);

        // Probe 1: prefer-hardware + optimize-for-latency.
        for name in hw_decoder_names(family) {
            let factory = DecoderFactory {
                codec_id,
                hw_name: Some(name),
                optimize_for_latency: true,
            };
            match factory.build(None) {
                Ok(_) => {
                    info!("decoder probe succeeded: {name} for {codec_tag}");
                    return Some(factory);
                }
                Err(err) => debug!("decoder probe {name} failed: {err:?}"),
            }
        }

        // Probe 2: any decoder, optimize-for-latency. Probe 3: plain.
        for optimize_for_latency in [true, false] {
            let factory = DecoderFactory {
                codec_id,
                hw_name: None,
                optimize_for_latency,
            };
            match factory.build(None) {
                Ok(_) => {
                    info!(
                        "decoder probe succeeded: software {:?} for {codec_tag} (low_delay={})",
                        codec_id, optimize_for_latency
                    );
                    return Some(factory);
                }
                Err(err) => debug!("software decoder probe failed: {err:?}"),
            }
        }

        None
    }

    fn spawn_decoder_thread(&mut self, factory: DecoderFactory) -> Result<(), PipelineError> {
        // Build the initial instance here so setup can fail loudly.
        let initial = factory
            .build(None)
            .map_err(|err| PipelineError::Configuration(format!("{err:?}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<DecoderCommand>();
        let base = self.base.clone();
        let queue_depth = self.queue_depth.clone();

        thread::spawn(move || {
            decoder_thread(initial, factory, cmd_rx, base, queue_depth);
        });

        self.cmd_tx = Some(cmd_tx);
        Ok(())
    }

    fn send(&mut self, command: DecoderCommand) {
        if let Some(tx) = &self.cmd_tx {
            if matches!(command, DecoderCommand::Decode { .. }) {
                self.queue_depth.fetch_add(1, Ordering::AcqRel);
            }
            if tx.send(command).is_err() {
                warn!("decoder thread gone, pipe errored");
                self.state = PipeState::Errored;
            }
        }
    }

    fn process_unit(&mut self, unit: EncodedUnit) {
        if unit.is_key() {
            self.requested_idr = false;
            self.request_pending = false;
            self.awaiting_keyframe = false;
        }

        match &mut self.translator {
            Some(translator) => {
                let output = match translator.submit_decode_unit(&unit) {
                    Ok(output) => output,
                    Err(err) => {
                        debug!("translator refused unit: {err}");
                        return;
                    }
                };
                if let Some(config) = output.configure {
                    // Reconfiguration rides the keyframe that produced it.
                    self.send(DecoderCommand::Configure(config));
                }
                if let Some(chunk) = output.chunk {
                    if !chunk.is_empty() {
                        self.send(DecoderCommand::Decode {
                            chunk,
                            timestamp_us: unit.timestamp_us,
                        });
                    }
                }
            }
            None => {
                // In-band mode: a delta with no keyframe behind it is noise.
                if self.awaiting_keyframe && !unit.is_key() {
                    return;
                }
                self.send(DecoderCommand::Decode {
                    chunk: unit.data,
                    timestamp_us: unit.timestamp_us,
                });
            }
        }
    }
}

impl Pipe for HardwareDecoderPipe {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        if !Self::environment_supported() {
            return Err(PipelineError::Unsupported("ffmpeg"));
        }
        self.base.lock().setup(config)?;
        self.fps = config.fps;

        let family = config.format.family();

        // In-band tag first; on total failure, the out-of-band variant with
        // the Annex-B translator attached.
        let factory = match Self::probe_sequence(family, config.format.in_band_codec()) {
            Some(factory) => factory,
            None if config.format.has_out_of_band_variant() => {
                let codec_tag = config.format.out_of_band_codec();
                match Self::probe_sequence(family, codec_tag) {
                    Some(factory) => {
                        info!("falling back to out-of-band {codec_tag}, translator attached");
                        self.translator = Some(StreamTranslator::new(config.format));
                        factory
                    }
                    None => {
                        self.state = PipeState::Errored;
                        return Err(PipelineError::Configuration(format!(
                            "no decoder for {codec_tag}"
                        )));
                    }
                }
            }
            None => {
                self.state = PipeState::Errored;
                return Err(PipelineError::Configuration(format!(
                    "no decoder for {}",
                    config.format.in_band_codec()
                )));
            }
        };

        self.spawn_decoder_thread(factory)?;
        self.state = PipeState::Configured;

        // Drain anything that arrived while setup was pending, in order.
        while let Some(unit) = self.pending.pop_front() {
            self.process_unit(unit);
        }
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        let kind = payload.kind();
        let PipePayload::EncodedVideo(unit) = payload else {
            warn!("hardware decoder ignoring {kind:?} payload");
            return;
        };

        match self.state {
            PipeState::Unconfigured => {
                if self.pending.len() >= PENDING_LIMIT {
                    warn!("hardware decoder pending queue full, dropping unit");
                    return;
                }
                self.pending.push_back(unit);
            }
            PipeState::Configured => self.process_unit(unit),
            PipeState::Errored | PipeState::Cleaned => {}
        }
    }

    /// Estimated queue delay is `queue / fps` seconds. Past 200 ms with a
    /// real backlog, ask for an IDR once and reset the decoder; the latch
    /// holds until the next keyframe arrives.
    fn poll_request_idr(&mut self) -> bool {
        if self.state != PipeState::Configured {
            return false;
        }
        let queue = self.queue_depth.load(Ordering::Acquire);
        let delay_ms = queue as f64 / self.fps.max(1) as f64 * 1000.0;

        if delay_ms > IDR_DELAY_THRESHOLD_MS && queue > IDR_QUEUE_THRESHOLD && !self.requested_idr
        {
            warn!(
                "decode queue {} deep (~{:.0} ms), requesting IDR and resetting decoder",
                queue, delay_ms
            );
            self.requested_idr = true;
            self.request_pending = true;
            self.awaiting_keyframe = true;
            self.send(DecoderCommand::Reset);
        }

        let own = std::mem::take(&mut self.request_pending);
        own | self.base.lock().poll_request_idr()
    }

    fn cleanup(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(DecoderCommand::Stop);
        }
        if let Some(translator) = &mut self.translator {
            translator.cleanup();
        }
        self.pending.clear();
        self.state = PipeState::Cleaned;
        self.base.lock().cleanup();
    }
}

/// Decoder thread: owns the FFmpeg context, converts output to planar
/// YUV420 and forwards it downstream.
fn decoder_thread(
    initial: decoder::Video,
    factory: DecoderFactory,
    cmd_rx: mpsc::Receiver<DecoderCommand>,
    base: Arc<Mutex<Box<dyn Pipe>>>,
    queue_depth: Arc<AtomicUsize>,
) {
    let mut current = Some(initial);
    let mut scaler: Option<ScalerContext> = None;
    let mut dimensions = (0u32, 0u32);
    let mut frames_decoded = 0u64;

    while let Ok(command) = cmd_rx.recv() {
        match command {
            DecoderCommand::Configure(config) => {
                // Close the old instance before binding the new description.
                current = None;
                scaler = None;
                match factory.build(config.description.as_deref()) {
                    Ok(decoder) => {
                        info!("decoder reconfigured for {}", config.codec);
                        current = Some(decoder);
                    }
                    Err(err) => {
                        warn!("decoder reconfiguration failed: {err:?}");
                    }
                }
            }
            DecoderCommand::Reset => {
                current = None;
                scaler = None;
                match factory.build(None) {
                    Ok(decoder) => current = Some(decoder),
                    Err(err) => warn!("decoder reset failed: {err:?}"),
                }
            }
            DecoderCommand::Decode { chunk, timestamp_us } => {
                if let Some(decoder) = current.as_mut() {
                    if let Some(frame) = decode_one(
                        decoder,
                        &mut scaler,
                        &mut dimensions,
                        &mut frames_decoded,
                        &chunk,
                        timestamp_us,
                    ) {
                        base.lock().submit(PipePayload::DecodedFrame(DecodedFrame::new(frame)));
                    }
                }
                queue_depth.fetch_sub(1, Ordering::AcqRel);
            }
            DecoderCommand::Stop => break,
        }
    }
}

fn decode_one(
    decoder: &mut decoder::Video,
    scaler: &mut Option<ScalerContext>,
    dimensions: &mut (u32, u32),
    frames_decoded: &mut u64,
    data: &[u8],
    timestamp_us: u64,
) -> Option<Yuv420VideoFrame> {
    let mut packet = Packet::new(data.len());
    packet.data_mut()?.copy_from_slice(data);

    if let Err(e) = decoder.send_packet(&packet) {
        match e {
            ffmpeg::Error::Other { errno } if errno == libc::EAGAIN => {}
            _ => debug!("send packet error: {:?}", e),
        }
    }

    let mut frame = FfmpegFrame::empty();
    match decoder.receive_frame(&mut frame) {
        Ok(_) => {
            *frames_decoded += 1;

            let w = frame.width();
            let h = frame.height();
            let format = frame.format();

            if scaler.is_none() || *dimensions != (w, h) {
                *dimensions = (w, h);
                match ScalerContext::get(format, w, h, Pixel::YUV420P, w, h, ScalerFlags::BILINEAR)
                {
                    Ok(s) => *scaler = Some(s),
                    Err(e) => {
                        warn!("failed to create scaler: {:?}", e);
                        return None;
                    }
                }
                if *frames_decoded == 1 {
                    info!("first decoded frame: {}x{}, format: {:?}", w, h, format);
                }
            }

            let mut yuv_frame = FfmpegFrame::empty();
            if let Some(s) = scaler.as_mut() {
                if let Err(e) = s.run(&frame, &mut yuv_frame) {
                    warn!("scaler run failed: {:?}", e);
                    return None;
                }
            } else {
                yuv_frame = frame;
            }

            Some(Yuv420VideoFrame {
                y_plane: yuv_frame.data(0).to_vec(),
                u_plane: yuv_frame.data(1).to_vec(),
                v_plane: yuv_frame.data(2).to_vec(),
                y_stride: yuv_frame.stride(0) as u32,
                uv_stride: yuv_frame.stride(1) as u32,
                width: w,
                height: h,
                timestamp_us,
            })
        }
        Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => None,
        Err(e) => {
            debug!("receive frame error: {:?}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameType;
    use crate::pipeline::test_support::RecordingSink;

    fn pipe_with_sink() -> HardwareDecoderPipe {
        HardwareDecoderPipe::new(Box::new(RecordingSink::new()))
    }

    fn pretend_configured(pipe: &mut HardwareDecoderPipe) {
        // Poll behavior is independent of a live decoder thread.
        pipe.state = PipeState::Configured;
        pipe.fps = 60;
    }

    #[test]
    fn test_idr_request_hysteresis() {
        let mut pipe = pipe_with_sink();
        pretend_configured(&mut pipe);

        // 20 pending units at 60 fps is a ~333 ms backlog.
        pipe.queue_depth.store(20, Ordering::Release);
        assert!(pipe.poll_request_idr(), "backlog must trigger a request");
        assert!(!pipe.poll_request_idr(), "request fires exactly once");
        assert!(!pipe.poll_request_idr());

        // A keyframe clears the latch; the backlog re-arms it.
        pipe.process_unit(EncodedUnit {
            frame_type: FrameType::Key,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            timestamp_us: 0,
            duration_us: 0,
        });
        pipe.queue_depth.store(20, Ordering::Release);
        assert!(pipe.poll_request_idr());
    }

    #[test]
    fn test_small_queue_does_not_request() {
        let mut pipe = pipe_with_sink();
        pretend_configured(&mut pipe);

        // 2 units is under the queue threshold even at high delay.
        pipe.fps = 1;
        pipe.queue_depth.store(2, Ordering::Release);
        assert!(!pipe.poll_request_idr());

        // 12 units at 60 fps is only 200 ms, not over it.
        pipe.fps = 60;
        pipe.queue_depth.store(12, Ordering::Release);
        assert!(!pipe.poll_request_idr());
    }

    #[test]
    fn test_delegates_idr_poll_to_base() {
        let sink = RecordingSink::new();
        let flag = sink.request_idr.clone();
        let mut pipe = HardwareDecoderPipe::new(Box::new(sink));
        pretend_configured(&mut pipe);

        flag.store(true, Ordering::SeqCst);
        assert!(pipe.poll_request_idr());
        assert!(!pipe.poll_request_idr());
    }

    #[test]
    fn test_pre_setup_submissions_are_parked() {
        let mut pipe = pipe_with_sink();
        for i in 0..5u64 {
            pipe.submit(PipePayload::EncodedVideo(EncodedUnit {
                frame_type: FrameType::Delta,
                data: Bytes::from_static(&[0, 0, 0, 1, 0x41]),
                timestamp_us: i * 16_667,
                duration_us: 16_667,
            }));
        }
        assert_eq!(pipe.pending.len(), 5);
    }

    #[test]
    fn test_translator_path_skips_undescribed_deltas() {
        let mut pipe = pipe_with_sink();
        pretend_configured(&mut pipe);
        pipe.translator = Some(StreamTranslator::new(VideoFormat::H264));

        // No description yet: the delta dies in the translator and nothing
        // is queued toward the (absent) decoder thread.
        pipe.process_unit(EncodedUnit {
            frame_type: FrameType::Delta,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A]),
            timestamp_us: 0,
            duration_us: 0,
        });
        assert_eq!(pipe.queue_depth.load(Ordering::Acquire), 0);
    }
}
