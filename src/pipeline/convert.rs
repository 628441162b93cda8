//! Scalar YUV to RGBA Conversion Pipe
//!
//! Fallback color conversion for render paths without a GPU shader.
//! Fixed-point BT.601 with saturation, stride-aware.

use log::warn;

use super::{Pipe, PipePayload};
use crate::error::PipelineError;
use crate::media::{RgbaVideoFrame, StreamConfig, Yuv420VideoFrame};

/// Converts decoded 4:2:0 frames to tightly packed RGBA for a CPU sink.
pub struct YuvToRgbaPipe {
    base: Box<dyn Pipe>,
}

impl YuvToRgbaPipe {
    pub fn new(base: Box<dyn Pipe>) -> Self {
        Self { base }
    }
}

impl Pipe for YuvToRgbaPipe {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        self.base.setup(config)
    }

    fn submit(&mut self, payload: PipePayload) {
        let kind = payload.kind();
        let planes = match payload {
            PipePayload::Yuv420(frame) => frame,
            PipePayload::DecodedFrame(mut frame) => match frame.take_planes() {
                Some(planes) => planes,
                None => return, // already closed upstream
            },
            _ => {
                warn!("yuv->rgba pipe ignoring {kind:?} payload");
                return;
            }
        };

        let rgba = yuv420_to_rgba(&planes);
        self.base.submit(PipePayload::Rgba(rgba));
    }

    fn poll_request_idr(&mut self) -> bool {
        self.base.poll_request_idr()
    }

    fn cleanup(&mut self) {
        self.base.cleanup();
    }
}

/// Per-pixel BT.601 conversion, coefficients scaled by 256 for integer math.
///
/// R = Y + 1.402*V, G = Y - 0.344*U - 0.714*V, B = Y + 1.772*U,
/// each clamped to [0, 255].
pub fn yuv420_to_rgba(frame: &Yuv420VideoFrame) -> RgbaVideoFrame {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let y_stride = frame.y_stride as usize;
    let uv_stride = frame.uv_stride as usize;

    let mut rgba = vec![0u8; width * height * 4];

    for row in 0..height {
        let y_row = row * y_stride;
        let uv_row = (row / 2) * uv_stride;
        let out_row = row * width * 4;

        for col in 0..width {
            let y = *frame.y_plane.get(y_row + col).unwrap_or(&0) as i32;
            let u = *frame.u_plane.get(uv_row + col / 2).unwrap_or(&128) as i32 - 128;
            let v = *frame.v_plane.get(uv_row + col / 2).unwrap_or(&128) as i32 - 128;

            let r = (y + ((359 * v) >> 8)).clamp(0, 255) as u8;
            let g = (y - ((88 * u + 183 * v) >> 8)).clamp(0, 255) as u8;
            let b = (y + ((454 * u) >> 8)).clamp(0, 255) as u8;

            let at = out_row + col * 4;
            rgba[at] = r;
            rgba[at + 1] = g;
            rgba[at + 2] = b;
            rgba[at + 3] = 255;
        }
    }

    RgbaVideoFrame {
        buffer: rgba,
        width: frame.width,
        height: frame.height,
        timestamp_us: frame.timestamp_us,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::DecodedFrame;
    use crate::pipeline::test_support::RecordingSink;
    use std::sync::atomic::Ordering;

    fn gray_frame() -> Yuv420VideoFrame {
        let mut frame = Yuv420VideoFrame::blank(2, 2);
        frame.y_plane.fill(128);
        frame
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        // Y=128, U=V=128 must come out mid-gray within BT.601 rounding.
        let rgba = yuv420_to_rgba(&gray_frame());
        assert_eq!(rgba.buffer.len(), 16);
        for pixel in rgba.buffer.chunks(4) {
            for &channel in &pixel[..3] {
                assert!((channel as i32 - 128).abs() <= 1, "channel {channel}");
            }
            assert_eq!(pixel[3], 255);
        }
    }

    #[test]
    fn test_saturation_clamps() {
        let mut frame = Yuv420VideoFrame::blank(2, 2);
        frame.y_plane.fill(255);
        frame.v_plane.fill(255); // drives red far past the top
        let rgba = yuv420_to_rgba(&frame);
        assert_eq!(rgba.buffer[0], 255);
        // Green is pulled below zero and must clamp.
        let mut frame = Yuv420VideoFrame::blank(2, 2);
        frame.y_plane.fill(0);
        frame.u_plane.fill(255);
        frame.v_plane.fill(255);
        let rgba = yuv420_to_rgba(&frame);
        assert_eq!(rgba.buffer[1], 0);
    }

    #[test]
    fn test_respects_stride_padding() {
        // 2x2 frame padded to a stride of 8.
        let frame = Yuv420VideoFrame {
            y_plane: vec![
                10, 20, 0, 0, 0, 0, 0, 0, // row 0 + pad
                30, 40, 0, 0, 0, 0, 0, 0, // row 1 + pad
            ],
            u_plane: vec![128, 0, 0, 0],
            v_plane: vec![128, 0, 0, 0],
            y_stride: 8,
            uv_stride: 4,
            width: 2,
            height: 2,
            timestamp_us: 0,
        };
        let rgba = yuv420_to_rgba(&frame);
        // Luma-only grays: R==G==B==Y for neutral chroma.
        assert_eq!(rgba.buffer[0], 10);
        assert_eq!(rgba.buffer[4], 20);
        assert_eq!(rgba.buffer[8], 30);
        assert_eq!(rgba.buffer[12], 40);
    }

    #[test]
    fn test_pipe_forwards_rgba_and_closes_frames() {
        let sink = RecordingSink::new();
        let frames = sink.frames.clone();
        let mut pipe = YuvToRgbaPipe::new(Box::new(sink));

        pipe.submit(PipePayload::Yuv420(gray_frame()));
        pipe.submit(PipePayload::DecodedFrame(DecodedFrame::new(gray_frame())));
        assert_eq!(frames.load(Ordering::SeqCst), 2);

        // A closed handle converts to nothing.
        let mut closed = DecodedFrame::new(gray_frame());
        closed.close();
        pipe.submit(PipePayload::DecodedFrame(closed));
        assert_eq!(frames.load(Ordering::SeqCst), 2);
    }
}
