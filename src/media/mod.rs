//! Media Pipeline Data Model
//!
//! Encoded units, decoded frames, and stream configuration shared by the
//! decode pipes and renderers.

mod annexb;
mod codec;
mod opus;
mod translator;

pub use annexb::{nal_units, NalUnit};
pub use codec::{CodecFamily, VideoFormat};
pub use self::opus::{MultistreamDecoder, OpusStatus};
pub use translator::{StreamTranslator, TranslatorOutput};

use bytes::Bytes;

/// Whether an encoded unit is a self-contained keyframe or a delta frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Contains an IDR (and, for H.264/H.265, the preceding parameter sets).
    Key,
    Delta,
}

/// One elementary video unit in decode order.
///
/// `data` is an Annex-B bytestream: NAL units each preceded by a
/// `00 00 01` or `00 00 00 01` start code.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub frame_type: FrameType,
    pub data: Bytes,
    pub timestamp_us: u64,
    pub duration_us: u64,
}

impl EncodedUnit {
    pub fn is_key(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// One Opus packet.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Bytes,
    pub timestamp_us: u64,
}

/// Interleaved PCM produced by the audio decode pipe.
#[derive(Debug, Clone)]
pub struct PcmBlock {
    pub samples: Vec<f32>,
    pub channels: u32,
    pub sample_rate: u32,
}

/// Hardware acceleration preference for a decoder configuration probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HardwareAcceleration {
    #[default]
    NoPreference,
    PreferHardware,
}

/// Decoder configuration negotiated by a decode pipe.
///
/// `description` is the raw AVCC or HVCC record (not an ISO box) and is
/// absent for the in-band profile.
#[derive(Debug, Clone, Default)]
pub struct DecoderConfig {
    pub codec: String,
    pub description: Option<Vec<u8>>,
    pub hardware_acceleration: HardwareAcceleration,
    pub optimize_for_latency: bool,
}

/// Planar 4:2:0 frame. Planes may be padded; rows are `stride` bytes apart.
#[derive(Debug, Clone)]
pub struct Yuv420VideoFrame {
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub y_stride: u32,
    pub uv_stride: u32,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
}

impl Yuv420VideoFrame {
    /// Mid-gray frame, used as a decode placeholder.
    pub fn blank(width: u32, height: u32) -> Self {
        let y_size = (width * height) as usize;
        let uv_size = ((width / 2) * height.div_ceil(2)) as usize;
        Self {
            y_plane: vec![16; y_size],
            u_plane: vec![128; uv_size],
            v_plane: vec![128; uv_size],
            y_stride: width,
            uv_stride: width / 2,
            width,
            height,
            timestamp_us: 0,
        }
    }
}

/// Tightly packed 8-bit RGBA frame.
#[derive(Debug, Clone)]
pub struct RgbaVideoFrame {
    pub buffer: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_us: u64,
}

/// Decoded frame handle handed between pipes.
///
/// The frame is owned by whichever pipe currently references it; a holder
/// must `close()` (or drop) the previous frame before storing a new one.
#[derive(Debug)]
pub struct DecodedFrame {
    display_width: u32,
    display_height: u32,
    timestamp_us: u64,
    planes: Option<Yuv420VideoFrame>,
}

impl DecodedFrame {
    pub fn new(planes: Yuv420VideoFrame) -> Self {
        Self {
            display_width: planes.width,
            display_height: planes.height,
            timestamp_us: planes.timestamp_us,
            planes: Some(planes),
        }
    }

    pub fn display_width(&self) -> u32 {
        self.display_width
    }

    pub fn display_height(&self) -> u32 {
        self.display_height
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Pixel data, `None` once closed.
    pub fn planes(&self) -> Option<&Yuv420VideoFrame> {
        self.planes.as_ref()
    }

    /// Take ownership of the pixel data, closing the handle.
    pub fn take_planes(&mut self) -> Option<Yuv420VideoFrame> {
        self.planes.take()
    }

    /// Release the pixel storage. Further reads return `None`.
    pub fn close(&mut self) {
        self.planes = None;
    }

    pub fn is_closed(&self) -> bool {
        self.planes.is_none()
    }
}

/// Opus multistream setup parameters delivered out of band.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub streams: u32,
    pub coupled_streams: u32,
    /// `mapping[channel] ∈ [0,255]`; 255 means silent channel.
    pub mapping: Vec<u8>,
    pub samples_per_frame: u32,
}

impl AudioConfig {
    /// Plain stereo, the common negotiation.
    pub fn stereo_48k() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            streams: 1,
            coupled_streams: 1,
            mapping: vec![0, 1],
            samples_per_frame: 240,
        }
    }
}

/// Everything a pipe needs to configure itself.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Draw decoded frames immediately instead of on the next redraw.
    pub low_latency: bool,
    pub audio: Option<AudioConfig>,
}

impl StreamConfig {
    pub fn new(format: VideoFormat, width: u32, height: u32, fps: u32) -> Self {
        Self {
            format,
            width,
            height,
            fps,
            low_latency: true,
            audio: None,
        }
    }
}

/// Counters surfaced to the embedder.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub resolution: String,
    pub fps: f32,
    pub codec: String,
    pub decode_time_ms: f32,
    pub frames_received: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub frames_rendered: u64,
    pub idr_requests: u64,
}

impl StreamStats {
    pub fn format_resolution(&self) -> String {
        if self.resolution.is_empty() {
            "N/A".to_string()
        } else {
            self.resolution.clone()
        }
    }
}
