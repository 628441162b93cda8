//! Opus Multistream Decoder Binding
//!
//! Multistream packets carry one packet per stream, all but the last in the
//! self-delimiting framing of RFC 6716 Appendix B. Each stream feeds its own
//! elementary decoder; decoded channels fan out to output channels through
//! the mapping table.

use log::debug;

use super::AudioConfig;
use crate::utils::with_scratch_f32;

/// Status codes surfaced by the decoder binding, matching the native
/// `{0, -1..-7}` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpusStatus {
    Ok,             // 0
    BadArg,         // -1
    BufferTooSmall, // -2
    Internal,       // -3
    InvalidPacket,  // -4
    Unimplemented,  // -5
    InvalidState,   // -6
    AllocFail,      // -7
}

impl OpusStatus {
    pub fn code(&self) -> i32 {
        match self {
            OpusStatus::Ok => 0,
            OpusStatus::BadArg => -1,
            OpusStatus::BufferTooSmall => -2,
            OpusStatus::Internal => -3,
            OpusStatus::InvalidPacket => -4,
            OpusStatus::Unimplemented => -5,
            OpusStatus::InvalidState => -6,
            OpusStatus::AllocFail => -7,
        }
    }

    fn from_error(err: &opus::Error) -> Self {
        match err.code() {
            opus::ErrorCode::BadArg => OpusStatus::BadArg,
            opus::ErrorCode::BufferTooSmall => OpusStatus::BufferTooSmall,
            opus::ErrorCode::InternalError => OpusStatus::Internal,
            opus::ErrorCode::InvalidPacket => OpusStatus::InvalidPacket,
            opus::ErrorCode::Unimplemented => OpusStatus::Unimplemented,
            opus::ErrorCode::InvalidState => OpusStatus::InvalidState,
            opus::ErrorCode::AllocFail => OpusStatus::AllocFail,
            _ => OpusStatus::Internal,
        }
    }
}

/// Channel source resolved from the mapping table at setup.
#[derive(Debug, Clone, Copy)]
enum ChannelSource {
    /// `(stream index, channel within that stream)`
    Stream(usize, usize),
    Silence,
}

/// Multistream decoder over per-stream elementary decoders.
#[derive(Debug)]
pub struct MultistreamDecoder {
    decoders: Vec<opus::Decoder>,
    coupled_streams: usize,
    channels: usize,
    sources: Vec<ChannelSource>,
    sample_rate: u32,
}

impl MultistreamDecoder {
    /// Create from the out-of-band setup parameters. `mapping` must have one
    /// entry per output channel; each entry indexes the decoded channels
    /// (coupled streams first, two channels each), 255 meaning silence.
    pub fn new(config: &AudioConfig) -> Result<Self, OpusStatus> {
        let streams = config.streams as usize;
        let coupled = config.coupled_streams as usize;
        let channels = config.channels as usize;

        if streams == 0 || coupled > streams || config.mapping.len() != channels {
            return Err(OpusStatus::BadArg);
        }

        let mut decoders = Vec::with_capacity(streams);
        for stream in 0..streams {
            let layout = if stream < coupled {
                opus::Channels::Stereo
            } else {
                opus::Channels::Mono
            };
            let decoder = opus::Decoder::new(config.sample_rate, layout)
                .map_err(|e| OpusStatus::from_error(&e))?;
            decoders.push(decoder);
        }

        let mut sources = Vec::with_capacity(channels);
        for &index in &config.mapping {
            let index = index as usize;
            if index == 255 {
                sources.push(ChannelSource::Silence);
            } else if index < coupled * 2 {
                sources.push(ChannelSource::Stream(index / 2, index % 2));
            } else if index - coupled * 2 < streams - coupled {
                sources.push(ChannelSource::Stream(coupled + (index - coupled * 2), 0));
            } else {
                return Err(OpusStatus::BadArg);
            }
        }

        debug!(
            "opus multistream decoder: {} streams ({} coupled), {} channels @ {} Hz",
            streams, coupled, channels, config.sample_rate
        );

        Ok(Self {
            decoders,
            coupled_streams: coupled,
            channels,
            sources,
            sample_rate: config.sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Decode one multistream packet into interleaved `f32` samples.
    ///
    /// `output` must hold `channels * frame_size` samples. `None` input
    /// invokes packet-loss concealment on every stream. Returns the number
    /// of samples decoded per channel.
    pub fn decode(
        &mut self,
        input: Option<&[u8]>,
        output: &mut [f32],
        frame_size: usize,
        decode_fec: bool,
    ) -> Result<usize, OpusStatus> {
        if output.len() < self.channels * frame_size {
            return Err(OpusStatus::BufferTooSmall);
        }
        output[..self.channels * frame_size].fill(0.0);

        let packets = match input {
            Some(data) => {
                split_streams(data, self.decoders.len()).ok_or(OpusStatus::InvalidPacket)?
            }
            None => vec![None; self.decoders.len()],
        };

        let channels = self.channels;
        let coupled = self.coupled_streams;
        let mut decoded = frame_size;

        for (stream, packet) in packets.iter().enumerate() {
            let stream_channels = if stream < coupled { 2 } else { 1 };
            let decoder = &mut self.decoders[stream];

            // Each native call runs in its own scratch region.
            let samples = with_scratch_f32(stream_channels * frame_size, |pcm| {
                let input: &[u8] = packet.as_deref().unwrap_or(&[]);
                let samples = decoder
                    .decode_float(input, pcm, decode_fec)
                    .map_err(|e| OpusStatus::from_error(&e))?;

                for (channel, source) in self.sources.iter().enumerate() {
                    if let ChannelSource::Stream(s, within) = source {
                        if *s != stream {
                            continue;
                        }
                        for sample in 0..samples.min(frame_size) {
                            output[sample * channels + channel] =
                                pcm[sample * stream_channels + within];
                        }
                    }
                }
                Ok(samples)
            })?;

            decoded = decoded.min(samples);
        }

        Ok(decoded)
    }
}

/// Split a multistream packet into one packet per stream. Streams before the
/// last use self-delimiting framing; each is rewritten to the undelimited
/// form its decoder expects. Returns `None` on malformed framing.
fn split_streams(data: &[u8], streams: usize) -> Option<Vec<Option<Vec<u8>>>> {
    let mut packets = Vec::with_capacity(streams);
    let mut rest = data;

    for _ in 0..streams.saturating_sub(1) {
        let (packet, consumed) = undelimit(rest)?;
        packets.push(Some(packet));
        rest = &rest[consumed..];
    }
    packets.push(Some(rest.to_vec()));
    Some(packets)
}

/// Frame length field: one byte below 252, otherwise `second * 4 + first`.
fn read_length(data: &[u8]) -> Option<(usize, usize)> {
    let first = *data.first()? as usize;
    if first < 252 {
        Some((first, 1))
    } else {
        let second = *data.get(1)? as usize;
        Some((second * 4 + first, 2))
    }
}

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 252 {
        out.push(len as u8);
    } else {
        let tail = 252 + (len - 252) % 4;
        out.push(tail as u8);
        out.push(((len - tail) / 4) as u8);
    }
}

/// Convert one self-delimited Opus packet at the head of `data` into its
/// undelimited form, returning the rewritten packet and the number of bytes
/// consumed. Framing per RFC 6716 §3.2 with the Appendix B extra length.
fn undelimit(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let toc = *data.first()?;
    let code = toc & 0x3;
    let mut at = 1;

    match code {
        // One frame; the extra length delimits it.
        0 => {
            let (len, used) = read_length(&data[at..])?;
            at += used;
            let frame = data.get(at..at + len)?;
            let mut packet = Vec::with_capacity(1 + len);
            packet.push(toc);
            packet.extend_from_slice(frame);
            Some((packet, at + len))
        }
        // Two equal frames; the extra length is the size of each.
        1 => {
            let (len, used) = read_length(&data[at..])?;
            at += used;
            let frames = data.get(at..at + 2 * len)?;
            let mut packet = Vec::with_capacity(1 + 2 * len);
            packet.push(toc);
            packet.extend_from_slice(frames);
            Some((packet, at + 2 * len))
        }
        // Two frames with explicit first length; the extra length covers
        // the second frame, which is implicit in the undelimited form.
        2 => {
            let (len1, used1) = read_length(&data[at..])?;
            at += used1;
            let (len2, used2) = read_length(&data[at..])?;
            at += used2;
            let frames = data.get(at..at + len1 + len2)?;
            let mut packet = Vec::with_capacity(2 + len1 + len2);
            packet.push(toc);
            write_length(&mut packet, len1);
            packet.extend_from_slice(frames);
            Some((packet, at + len1 + len2))
        }
        // Code 3: count byte, then CBR gains one shared length and VBR
        // gains the final frame's length. Padding is stripped on rewrite.
        _ => {
            let count_byte = *data.get(at)?;
            at += 1;
            let vbr = count_byte & 0x80 != 0;
            let padded = count_byte & 0x40 != 0;
            let frame_count = (count_byte & 0x3F) as usize;
            if frame_count == 0 {
                return None;
            }

            let mut padding = 0usize;
            if padded {
                loop {
                    let b = *data.get(at)? as usize;
                    at += 1;
                    if b == 255 {
                        padding += 254;
                    } else {
                        padding += b;
                        break;
                    }
                }
            }

            let mut packet = Vec::new();
            packet.push(toc);
            packet.push(count_byte & !0x40); // padding does not survive

            if vbr {
                let mut lengths = Vec::with_capacity(frame_count);
                for _ in 0..frame_count {
                    let (len, used) = read_length(&data[at..])?;
                    at += used;
                    lengths.push(len);
                }
                // Undelimited VBR omits the last frame's length.
                for &len in &lengths[..frame_count - 1] {
                    write_length(&mut packet, len);
                }
                let total: usize = lengths.iter().sum();
                let frames = data.get(at..at + total)?;
                packet.extend_from_slice(frames);
                at += total + padding;
                Some((packet, at))
            } else {
                let (len, used) = read_length(&data[at..])?;
                at += used;
                let total = len * frame_count;
                let frames = data.get(at..at + total)?;
                packet.extend_from_slice(frames);
                at += total + padding;
                Some((packet, at))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_field_round_trip() {
        for len in [0, 1, 100, 251, 252, 255, 400, 1275] {
            let mut out = Vec::new();
            write_length(&mut out, len);
            let (read, used) = read_length(&out).unwrap();
            assert_eq!(read, len);
            assert_eq!(used, out.len());
        }
    }

    #[test]
    fn test_undelimit_code0() {
        // toc code 0, frame of 3 bytes.
        let data = [0xF8, 3, 0xAA, 0xBB, 0xCC, 0xDE, 0xAD];
        let (packet, consumed) = undelimit(&data).unwrap();
        assert_eq!(packet, vec![0xF8, 0xAA, 0xBB, 0xCC]);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_undelimit_code2_keeps_first_length() {
        // toc code 2, frames of 2 and 3 bytes.
        let data = [0xFA, 2, 3, 0x01, 0x02, 0x11, 0x12, 0x13, 0xFF];
        let (packet, consumed) = undelimit(&data).unwrap();
        assert_eq!(packet, vec![0xFA, 2, 0x01, 0x02, 0x11, 0x12, 0x13]);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_undelimit_truncated_packet() {
        let data = [0xF8, 10, 0xAA];
        assert!(undelimit(&data).is_none());
    }

    #[test]
    fn test_stereo_round_trip_rms() {
        let config = AudioConfig::stereo_48k();
        let mut decoder = MultistreamDecoder::new(&config).unwrap();

        let frame_size = 960usize;
        let mut pcm = vec![0f32; frame_size * 2];
        for i in 0..frame_size {
            let s = (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48_000.0).sin() * 0.5;
            pcm[i * 2] = s;
            pcm[i * 2 + 1] = s;
        }

        let mut encoder =
            opus::Encoder::new(48_000, opus::Channels::Stereo, opus::Application::Audio).unwrap();
        let packet = encoder.encode_vec_float(&pcm, 4000).unwrap();

        let mut out = vec![0f32; frame_size * 2];
        // Warm the decoder past its transient, then measure a second frame.
        decoder.decode(Some(&packet), &mut out, frame_size, false).unwrap();
        let packet2 = encoder.encode_vec_float(&pcm, 4000).unwrap();
        let decoded = decoder
            .decode(Some(&packet2), &mut out, frame_size, false)
            .unwrap();
        assert!(decoded >= 960);

        let rms = |samples: &[f32]| {
            (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
        };
        let input_rms = rms(&pcm);
        let output_rms = rms(&out[..decoded * 2]);
        assert!(
            (output_rms - input_rms).abs() / input_rms < 0.1,
            "rms drift: in={input_rms} out={output_rms}"
        );
    }

    #[test]
    fn test_plc_produces_samples() {
        let config = AudioConfig::stereo_48k();
        let mut decoder = MultistreamDecoder::new(&config).unwrap();
        let mut out = vec![0f32; 960 * 2];
        let decoded = decoder.decode(None, &mut out, 960, false).unwrap();
        assert!(decoded > 0);
    }

    #[test]
    fn test_bad_mapping_rejected() {
        let mut config = AudioConfig::stereo_48k();
        config.mapping = vec![0, 9]; // indexes past the decoded channels
        assert_eq!(MultistreamDecoder::new(&config).unwrap_err(), OpusStatus::BadArg);
    }

    #[test]
    fn test_short_output_buffer() {
        let config = AudioConfig::stereo_48k();
        let mut decoder = MultistreamDecoder::new(&config).unwrap();
        let mut out = vec![0f32; 100];
        assert_eq!(
            decoder.decode(None, &mut out, 960, false).unwrap_err(),
            OpusStatus::BufferTooSmall
        );
    }
}
