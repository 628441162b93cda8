//! Farview Streamer - Elementary Stream Player
//!
//! Plays an Annex-B elementary stream file through the decode pipeline into
//! a window, exercising the same pipe graph the streaming client drives
//! from its transport.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

use farview_streamer::config::{ForcedRenderer, Settings};
use farview_streamer::media::{
    nal_units, CodecFamily, EncodedUnit, FrameType, StreamConfig, StreamStats, VideoFormat,
};
use farview_streamer::pipeline::{
    build_pipeline, BuildContext, EnvCaps, OutputKind, RendererSpec,
};
use farview_streamer::render::{PresentCallback, VideoRenderer};
use farview_streamer::utils;

struct PlayerApp {
    settings: Settings,
    format: VideoFormat,
    units: Vec<EncodedUnit>,
    window: Option<Arc<Window>>,
    renderer: Option<VideoRenderer>,
    context: Option<BuildContext>,
    feeder: Option<thread::JoinHandle<()>>,
    frames_rendered: u64,
    last_stats_log: Instant,
}

impl PlayerApp {
    fn start_pipeline(&mut self) -> Result<()> {
        let window = self.window.clone().context("window not created yet")?;

        let mut ctx = BuildContext::new();
        let redraw_window = window.clone();
        let present: PresentCallback = Arc::new(move || redraw_window.request_redraw());
        ctx.present = Some(present);
        ctx.disable_high444_decode = self.settings.disable_high444_decode;
        ctx.forced_renderer = self.settings.forced_renderer.map(|forced| match forced {
            ForcedRenderer::GpuYuv => RendererSpec::GpuYuv,
            ForcedRenderer::RgbaBuffer => RendererSpec::RgbaBuffer,
            ForcedRenderer::MediaSource => RendererSpec::MediaSource,
        });

        let env = EnvCaps::detect(&ctx);
        info!("environment: {env:?}");

        let built = build_pipeline(OutputKind::VideoTrack, &[self.format], &env, &ctx)?;
        info!("playing through chain {}", built.chain_name);

        let mut config = StreamConfig::new(
            self.format,
            self.settings.resolution_tuple().0,
            self.settings.resolution_tuple().1,
            self.settings.fps,
        );
        config.low_latency = self.settings.low_latency_mode;

        let mut head = built.head;
        head.setup(&config)
            .context("pipeline setup failed")?;

        // Feed at stream pace on a background thread; the pipes take it
        // from there.
        let units = std::mem::take(&mut self.units);
        let fps = self.settings.fps.max(1);
        self.feeder = Some(thread::spawn(move || {
            let frame_interval = Duration::from_micros(1_000_000 / fps as u64);
            let start = Instant::now();
            for (index, unit) in units.into_iter().enumerate() {
                let due = start + frame_interval * index as u32;
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
                head.submit(farview_streamer::pipeline::PipePayload::EncodedVideo(unit));
                if head.poll_request_idr() {
                    // A file player has no encoder to ask; note it and move on.
                    warn!("pipeline requested an IDR");
                }
            }
            info!("stream finished");
            head.cleanup();
        }));

        self.context = Some(ctx);
        Ok(())
    }

    fn draw(&mut self) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let mut drew = false;
        if let Some(ctx) = &self.context {
            if let Some(frame) = ctx.yuv_slot.read() {
                renderer.update_video(&frame);
                drew = true;
            }
            if let Some(frame) = ctx.rgba_slot.read() {
                renderer.update_rgba(&frame);
                drew = true;
            }
        }
        renderer.render();
        if drew {
            self.frames_rendered += 1;
        }

        if self.last_stats_log.elapsed() >= Duration::from_secs(5) {
            self.last_stats_log = Instant::now();
            let stats = self.snapshot_stats();
            info!(
                "stats: {} {} | decoded {} rendered {}",
                stats.codec, stats.resolution, stats.frames_decoded, stats.frames_rendered
            );
        }
    }

    fn snapshot_stats(&self) -> StreamStats {
        let decoded = self
            .context
            .as_ref()
            .map(|ctx| ctx.yuv_slot.frames_written() + ctx.rgba_slot.frames_written())
            .unwrap_or(0);
        StreamStats {
            resolution: self.settings.resolution.clone(),
            codec: self.format.display_name().to_string(),
            fps: self.settings.fps as f32,
            frames_decoded: decoded,
            frames_rendered: self.frames_rendered,
            ..Default::default()
        }
    }
}

impl ApplicationHandler for PlayerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = WindowAttributes::default()
            .with_title("Farview Player")
            .with_inner_size(PhysicalSize::new(1280, 720));
        let window = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                error!("failed to create window: {err}");
                event_loop.exit();
                return;
            }
        };

        match pollster::block_on(VideoRenderer::new(window.clone())) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(err) => {
                error!("failed to create renderer: {err:#}");
                event_loop.exit();
                return;
            }
        }
        self.window = Some(window);

        if let Err(err) = self.start_pipeline() {
            error!("failed to start pipeline: {err:#}");
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => event_loop.exit(),
            WindowEvent::Resized(size) => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                self.draw();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}

/// Group the NAL units of an elementary stream into per-frame units: each
/// VCL NAL closes a unit, carrying any parameter sets seen before it.
fn split_units(data: &[u8], family: CodecFamily, fps: u32) -> Vec<EncodedUnit> {
    let frame_interval = 1_000_000 / fps.max(1) as u64;
    let mut units = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut is_key = false;

    let mut push_nal = |current: &mut Vec<u8>, nal: &[u8]| {
        current.extend_from_slice(&[0, 0, 0, 1]);
        current.extend_from_slice(nal);
    };

    for nal in nal_units(data) {
        let (vcl, key) = match family {
            CodecFamily::H264 => {
                let t = nal.h264_type();
                (matches!(t, 1..=5), t == 5)
            }
            CodecFamily::H265 => {
                let t = nal.h265_type();
                (t <= 31, matches!(t, 19 | 20))
            }
            // AV1 demo input uses one temporal unit per Annex-B chunk.
            CodecFamily::Av1 => (true, units.is_empty()),
        };

        push_nal(&mut current, nal.data);
        is_key |= key;

        if vcl {
            let timestamp_us = units.len() as u64 * frame_interval;
            units.push(EncodedUnit {
                frame_type: if is_key { FrameType::Key } else { FrameType::Delta },
                data: Bytes::from(std::mem::take(&mut current)),
                timestamp_us,
                duration_us: frame_interval,
            });
            is_key = false;
        }
    }

    units
}

fn format_from_arg(arg: &str) -> Option<VideoFormat> {
    match arg {
        "h264" => Some(VideoFormat::H264),
        "h265" | "hevc" => Some(VideoFormat::H265),
        "av1" => Some(VideoFormat::Av1Main8),
        _ => None,
    }
}

fn main() -> Result<()> {
    let settings = Settings::load().unwrap_or_default();
    utils::init_logging(settings.log_to_file, true);

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .context("usage: farview-streamer <stream.h264> [h264|h265|av1]")?;
    let format = args
        .next()
        .as_deref()
        .and_then(format_from_arg)
        .unwrap_or(VideoFormat::H264);

    let data = std::fs::read(&path).with_context(|| format!("failed to read {path}"))?;
    let units = split_units(&data, format.family(), settings.fps);
    anyhow::ensure!(!units.is_empty(), "no NAL units found in {path}");
    info!("loaded {} units from {path}", units.len());

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = PlayerApp {
        settings,
        format,
        units,
        window: None,
        renderer: None,
        context: None,
        feeder: None,
        frames_rendered: 0,
        last_stats_log: Instant::now(),
    };
    event_loop.run_app(&mut app)?;

    if let Some(feeder) = app.feeder.take() {
        let _ = feeder.join();
    }
    Ok(())
}
