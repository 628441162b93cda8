//! Software Decoder Pipe
//!
//! H.264 fallback for environments without a usable hardware decoder. The
//! OpenH264 decoder is loaded asynchronously on its own thread; units
//! submitted before the pipe is configured are parked and drained in order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{Pipe, PipePayload, PipeState, Support};
use crate::error::PipelineError;
use crate::media::{EncodedUnit, StreamConfig, VideoFormat, Yuv420VideoFrame};

/// Units parked before `setup` completes.
const PENDING_LIMIT: usize = 64;

enum Command {
    Decode(EncodedUnit),
    Stop,
}

/// Wraps an OpenH264 decoder running on a dedicated thread.
pub struct SoftwareDecoderPipe {
    base: Arc<Mutex<Box<dyn Pipe>>>,
    state: PipeState,
    cmd_tx: Option<mpsc::Sender<Command>>,
    errored: Arc<AtomicBool>,
    pending: VecDeque<EncodedUnit>,
}

impl SoftwareDecoderPipe {
    pub fn new(base: Box<dyn Pipe>) -> Self {
        Self {
            base: Arc::new(Mutex::new(base)),
            state: PipeState::Unconfigured,
            cmd_tx: None,
            errored: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
        }
    }

    /// Codec coverage is decidable statically: plain H.264 only.
    pub fn format_support(format: VideoFormat) -> Support {
        match format {
            VideoFormat::H264 => Support::Yes,
            _ => Support::No,
        }
    }

    fn spawn_decoder_thread(&mut self) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let base = self.base.clone();
        let errored = self.errored.clone();

        thread::spawn(move || {
            // The load is the slow part; commands queue up behind it.
            let mut decoder = match openh264::decoder::Decoder::new() {
                Ok(decoder) => {
                    info!("openh264 decoder loaded");
                    decoder
                }
                Err(err) => {
                    warn!("failed to load openh264 decoder: {err}");
                    errored.store(true, Ordering::Release);
                    return;
                }
            };

            let mut seen_keyframe = false;
            while let Ok(command) = cmd_rx.recv() {
                let unit = match command {
                    Command::Decode(unit) => unit,
                    Command::Stop => break,
                };

                // The decoder cannot start mid-GOP.
                if !seen_keyframe {
                    if !unit.is_key() {
                        continue;
                    }
                    seen_keyframe = true;
                }

                match decoder.decode(&unit.data) {
                    Ok(Some(yuv)) => {
                        let frame = copy_decoded(&yuv, unit.timestamp_us);
                        base.lock().submit(PipePayload::Yuv420(frame));
                    }
                    Ok(None) => {} // decoder needs more input
                    Err(err) => {
                        debug!("openh264 decode error: {err}");
                    }
                }
            }
        });

        self.cmd_tx = Some(cmd_tx);
    }

    fn send(&mut self, unit: EncodedUnit) {
        if let Some(tx) = &self.cmd_tx {
            if tx.send(Command::Decode(unit)).is_err() {
                warn!("software decoder thread gone, pipe errored");
                self.state = PipeState::Errored;
            }
        }
    }
}

fn copy_decoded(yuv: &openh264::decoder::DecodedYUV<'_>, timestamp_us: u64) -> Yuv420VideoFrame {
    use openh264::formats::YUVSource;

    let (width, height) = yuv.dimensions();
    let (y_stride, u_stride, _v_stride) = yuv.strides();
    Yuv420VideoFrame {
        y_plane: yuv.y().to_vec(),
        u_plane: yuv.u().to_vec(),
        v_plane: yuv.v().to_vec(),
        y_stride: y_stride as u32,
        uv_stride: u_stride as u32,
        width: width as u32,
        height: height as u32,
        timestamp_us,
    }
}

impl Pipe for SoftwareDecoderPipe {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        if Self::format_support(config.format) == Support::No {
            return Err(PipelineError::Unsupported("openh264 only decodes H.264"));
        }

        self.base.lock().setup(config)?;
        self.spawn_decoder_thread();
        self.state = PipeState::Configured;

        while let Some(unit) = self.pending.pop_front() {
            self.send(unit);
        }
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        if self.errored.load(Ordering::Acquire) {
            self.state = PipeState::Errored;
        }
        let kind = payload.kind();
        let PipePayload::EncodedVideo(unit) = payload else {
            warn!("software decoder ignoring {kind:?} payload");
            return;
        };

        match self.state {
            PipeState::Unconfigured => {
                if self.pending.len() >= PENDING_LIMIT {
                    warn!("software decoder pending queue full, dropping unit");
                    return;
                }
                self.pending.push_back(unit);
            }
            PipeState::Configured => self.send(unit),
            PipeState::Errored | PipeState::Cleaned => {}
        }
    }

    fn poll_request_idr(&mut self) -> bool {
        self.base.lock().poll_request_idr()
    }

    fn cleanup(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(Command::Stop);
        }
        self.pending.clear();
        self.state = PipeState::Cleaned;
        self.base.lock().cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameType;
    use crate::pipeline::test_support::RecordingSink;
    use bytes::Bytes;

    fn delta() -> EncodedUnit {
        EncodedUnit {
            frame_type: FrameType::Delta,
            data: Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9A]),
            timestamp_us: 0,
            duration_us: 16_667,
        }
    }

    #[test]
    fn test_pre_setup_submissions_are_parked() {
        let sink = RecordingSink::new();
        let mut pipe = SoftwareDecoderPipe::new(Box::new(sink));
        for _ in 0..10 {
            pipe.submit(PipePayload::EncodedVideo(delta()));
        }
        assert_eq!(pipe.pending.len(), 10);
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let sink = RecordingSink::new();
        let mut pipe = SoftwareDecoderPipe::new(Box::new(sink));
        for _ in 0..PENDING_LIMIT + 10 {
            pipe.submit(PipePayload::EncodedVideo(delta()));
        }
        assert_eq!(pipe.pending.len(), PENDING_LIMIT);
    }

    #[test]
    fn test_rejects_non_h264_setup() {
        let sink = RecordingSink::new();
        let mut pipe = SoftwareDecoderPipe::new(Box::new(sink));
        let err = pipe
            .setup(&StreamConfig::new(VideoFormat::H265, 1280, 720, 60))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unsupported(_)));
    }

    #[test]
    fn test_cleanup_cascades_and_drops_later_submissions() {
        let sink = RecordingSink::new();
        let cleanups = sink.cleanups.clone();
        let mut pipe = SoftwareDecoderPipe::new(Box::new(sink));
        pipe.cleanup();
        assert_eq!(cleanups.load(std::sync::atomic::Ordering::SeqCst), 1);
        pipe.submit(PipePayload::EncodedVideo(delta()));
        assert_eq!(pipe.pending.len(), 0);
    }
}
