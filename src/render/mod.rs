//! Frame Sinks and Presentation
//!
//! Renderer pipes terminate the video chain: they take ownership of decoded
//! frames and hand the pixels to the presenter. The presenter (window event
//! loop + GPU surface) drains a latest-frame slot on its own schedule; in
//! low-latency mode the sink kicks it immediately instead of waiting for
//! the next redraw.

mod shaders;
mod wgpu_yuv;

pub use shaders::{RGBA_SHADER, YUV_SHADER};
pub use wgpu_yuv::{gpu_available, VideoRenderer};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::media::{RgbaVideoFrame, StreamConfig, Yuv420VideoFrame};
use crate::pipeline::{Pipe, PipePayload, PipeState};

/// Latest-frame handoff slot between a sink pipe and the presenter.
///
/// The writer replaces the stored frame (the previous one is released
/// first), the reader takes it. No queue: a slow presenter sees only the
/// newest frame.
pub struct FrameSlot<T> {
    frame: Mutex<Option<T>>,
    write_count: AtomicU64,
    read_count: AtomicU64,
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            write_count: AtomicU64::new(0),
            read_count: AtomicU64::new(0),
        }
    }

    pub fn write(&self, frame: T) {
        let mut slot = self.frame.lock();
        // Release the stale frame before the replacement lands.
        drop(slot.take());
        *slot = Some(frame);
        self.write_count.fetch_add(1, Ordering::Release);
    }

    pub fn has_new_frame(&self) -> bool {
        self.write_count.load(Ordering::Acquire) > self.read_count.load(Ordering::Acquire)
    }

    /// Take the latest frame, if one arrived since the last read.
    pub fn read(&self) -> Option<T> {
        let current = self.write_count.load(Ordering::Acquire);
        if current > self.read_count.load(Ordering::Acquire) {
            self.read_count.store(current, Ordering::Release);
            self.frame.lock().take()
        } else {
            None
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakes the presenter (typically `Window::request_redraw`).
pub type PresentCallback = Arc<dyn Fn() + Send + Sync>;

/// Terminal pipe for decoded frames headed to the GPU YUV presenter.
pub struct GpuYuvSink {
    slot: Arc<FrameSlot<Yuv420VideoFrame>>,
    present: Option<PresentCallback>,
    low_latency: bool,
    state: PipeState,
    surface_size: (u32, u32),
}

impl GpuYuvSink {
    pub fn new(slot: Arc<FrameSlot<Yuv420VideoFrame>>, present: Option<PresentCallback>) -> Self {
        Self {
            slot,
            present,
            low_latency: true,
            state: PipeState::Unconfigured,
            surface_size: (0, 0),
        }
    }

    fn publish(&mut self, planes: Yuv420VideoFrame) {
        if (planes.width, planes.height) != self.surface_size {
            debug!(
                "video dimensions now {}x{} (was {}x{})",
                planes.width, planes.height, self.surface_size.0, self.surface_size.1
            );
            self.surface_size = (planes.width, planes.height);
        }

        self.slot.write(planes);
        if self.low_latency {
            if let Some(present) = &self.present {
                present();
            }
        }
    }
}

impl Pipe for GpuYuvSink {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        self.low_latency = config.low_latency;
        self.state = PipeState::Configured;
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        if self.state == PipeState::Cleaned {
            return;
        }
        match payload {
            PipePayload::Yuv420(planes) => self.publish(planes),
            PipePayload::DecodedFrame(mut frame) => {
                // Taking the planes closes the handle.
                if let Some(planes) = frame.take_planes() {
                    self.publish(planes);
                }
            }
            other => warn!("gpu yuv sink ignoring {:?} payload", other.kind()),
        }
    }

    fn cleanup(&mut self) {
        self.state = PipeState::Cleaned;
    }
}

/// Terminal pipe for CPU-converted RGBA frames.
pub struct RgbaSink {
    slot: Arc<FrameSlot<RgbaVideoFrame>>,
    present: Option<PresentCallback>,
    low_latency: bool,
    state: PipeState,
}

impl RgbaSink {
    pub fn new(slot: Arc<FrameSlot<RgbaVideoFrame>>, present: Option<PresentCallback>) -> Self {
        Self {
            slot,
            present,
            low_latency: true,
            state: PipeState::Unconfigured,
        }
    }
}

impl Pipe for RgbaSink {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        self.low_latency = config.low_latency;
        self.state = PipeState::Configured;
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        if self.state == PipeState::Cleaned {
            return;
        }
        let kind = payload.kind();
        let PipePayload::Rgba(frame) = payload else {
            warn!("rgba sink ignoring {kind:?} payload");
            return;
        };
        self.slot.write(frame);
        if self.low_latency {
            if let Some(present) = &self.present {
                present();
            }
        }
    }

    fn cleanup(&mut self) {
        self.state = PipeState::Cleaned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DecodedFrame, VideoFormat};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_frame_slot_latest_wins() {
        let slot = FrameSlot::new();
        slot.write(1u32);
        slot.write(2);
        slot.write(3);
        assert!(slot.has_new_frame());
        assert_eq!(slot.read(), Some(3));
        assert!(!slot.has_new_frame());
        assert_eq!(slot.read(), None);
    }

    #[test]
    fn test_sink_kicks_presenter_in_low_latency_mode() {
        let slot = Arc::new(FrameSlot::new());
        let kicks = Arc::new(AtomicUsize::new(0));
        let counter = kicks.clone();
        let present: PresentCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut sink = GpuYuvSink::new(slot.clone(), Some(present));
        sink.setup(&StreamConfig::new(VideoFormat::H264, 640, 360, 60))
            .unwrap();

        sink.submit(PipePayload::Yuv420(Yuv420VideoFrame::blank(640, 360)));
        assert_eq!(kicks.load(Ordering::SeqCst), 1);
        assert!(slot.has_new_frame());
    }

    #[test]
    fn test_sink_defers_when_not_low_latency() {
        let slot = Arc::new(FrameSlot::new());
        let kicks = Arc::new(AtomicUsize::new(0));
        let counter = kicks.clone();
        let present: PresentCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut sink = GpuYuvSink::new(slot.clone(), Some(present));
        let mut config = StreamConfig::new(VideoFormat::H264, 640, 360, 60);
        config.low_latency = false;
        sink.setup(&config).unwrap();

        sink.submit(PipePayload::DecodedFrame(DecodedFrame::new(
            Yuv420VideoFrame::blank(640, 360),
        )));
        assert_eq!(kicks.load(Ordering::SeqCst), 0);
        assert!(slot.has_new_frame());
    }

    #[test]
    fn test_cleaned_sink_drops_frames() {
        let slot = Arc::new(FrameSlot::new());
        let mut sink = GpuYuvSink::new(slot.clone(), None);
        sink.cleanup();
        sink.submit(PipePayload::Yuv420(Yuv420VideoFrame::blank(16, 16)));
        assert!(!slot.has_new_frame());
    }
}
