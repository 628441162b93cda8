//! Annex-B Stream Translator
//!
//! Rewrites an Annex-B elementary stream into the length-prefixed chunk a
//! hardware decoder in AVCC/HVCC mode expects, extracting in-band parameter
//! sets to synthesize the out-of-band description record.

use bytes::Bytes;
use log::{debug, error};

use super::annexb::nal_units;
use super::codec::{CodecFamily, VideoFormat};
use super::{DecoderConfig, EncodedUnit};
use crate::error::PipelineError;
use crate::utils::ByteWriter;

const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;
const H265_NAL_VPS: u8 = 32;
const H265_NAL_SPS: u8 = 33;
const H265_NAL_PPS: u8 = 34;

/// Result of translating one encoded unit.
#[derive(Debug, Default)]
pub struct TranslatorOutput {
    /// Set when fresh parameter sets produced a new description; the decoder
    /// must be reset and reconfigured before submitting `chunk`.
    pub configure: Option<DecoderConfig>,
    /// Length-prefixed bitstream for the decoder. `None` when the unit was
    /// skipped, zero-length when it carried only parameter sets.
    pub chunk: Option<Bytes>,
}

/// Annex-B → AVCC/HVCC translator.
///
/// Parameter sets extracted from keyframes are buffered until the codec's
/// full set is pending, then consumed into a description. `has_description`
/// latches on the first successful reconfigure and never reverts.
pub struct StreamTranslator {
    family: CodecFamily,
    config: DecoderConfig,
    has_description: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    vps: Option<Vec<u8>>,
    current_frame: ByteWriter,
    cleaned: bool,
}

impl StreamTranslator {
    pub fn new(format: VideoFormat) -> Self {
        Self {
            family: format.family(),
            config: DecoderConfig {
                codec: format.out_of_band_codec().to_string(),
                description: None,
                hardware_acceleration: Default::default(),
                optimize_for_latency: true,
            },
            has_description: false,
            sps: None,
            pps: None,
            vps: None,
            current_frame: ByteWriter::with_capacity(64 * 1024),
            cleaned: false,
        }
    }

    pub fn has_description(&self) -> bool {
        self.has_description
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Refuse further state mutation. Submissions now fail.
    pub fn cleanup(&mut self) {
        self.cleaned = true;
    }

    /// Translate one unit.
    ///
    /// Delta units before the first description are skipped entirely
    /// (`chunk == None`). A keyframe that still yields no description is a
    /// bitstream fault: it is logged once per occurrence but the chunk is
    /// forwarded anyway in case the decoder tolerates it.
    pub fn submit_decode_unit(
        &mut self,
        unit: &EncodedUnit,
    ) -> Result<TranslatorOutput, PipelineError> {
        if self.cleaned {
            return Err(PipelineError::CleanedUp);
        }

        if !unit.is_key() && !self.has_description {
            return Ok(TranslatorOutput::default());
        }

        self.current_frame.clear();

        for nal in nal_units(&unit.data) {
            match self.family {
                CodecFamily::H264 => match nal.h264_type() {
                    H264_NAL_SPS => {
                        debug!("translator: buffering SPS ({} bytes)", nal.data.len());
                        self.update_h264_codec_string(nal.data);
                        self.sps = Some(nal.data.to_vec());
                    }
                    H264_NAL_PPS => {
                        debug!("translator: buffering PPS ({} bytes)", nal.data.len());
                        self.pps = Some(nal.data.to_vec());
                    }
                    _ => self.append_length_prefixed(nal.data),
                },
                CodecFamily::H265 => match nal.h265_type() {
                    H265_NAL_VPS => {
                        debug!("translator: buffering VPS ({} bytes)", nal.data.len());
                        self.vps = Some(nal.data.to_vec());
                    }
                    H265_NAL_SPS => {
                        debug!("translator: buffering SPS ({} bytes)", nal.data.len());
                        self.sps = Some(nal.data.to_vec());
                    }
                    H265_NAL_PPS => {
                        debug!("translator: buffering PPS ({} bytes)", nal.data.len());
                        self.pps = Some(nal.data.to_vec());
                    }
                    _ => self.append_length_prefixed(nal.data),
                },
                // AV1 never goes through the translator.
                CodecFamily::Av1 => self.append_length_prefixed(nal.data),
            }
        }

        let configure = self.try_consume_parameter_sets();

        if unit.is_key() && !self.has_description {
            error!(
                "keyframe without parameter sets and no cached description; \
                 forwarding chunk and hoping the decoder holds state"
            );
        }

        Ok(TranslatorOutput {
            configure,
            chunk: Some(Bytes::copy_from_slice(self.current_frame.as_slice())),
        })
    }

    fn append_length_prefixed(&mut self, nal: &[u8]) {
        self.current_frame.write_u32(nal.len() as u32);
        self.current_frame.write_bytes(nal);
    }

    fn parameter_sets_complete(&self) -> bool {
        match self.family {
            CodecFamily::H264 => self.sps.is_some() && self.pps.is_some(),
            CodecFamily::H265 => self.vps.is_some() && self.sps.is_some() && self.pps.is_some(),
            CodecFamily::Av1 => false,
        }
    }

    /// When the codec's full parameter-set set is pending, consume it into a
    /// fresh description, latch `has_description`, and return the config to
    /// re-apply.
    fn try_consume_parameter_sets(&mut self) -> Option<DecoderConfig> {
        if !self.parameter_sets_complete() {
            return None;
        }

        let description = match self.family {
            CodecFamily::H264 => build_avcc(&self.sps.take()?, &self.pps.take()?),
            CodecFamily::H265 => {
                build_hvcc(&self.vps.take()?, &self.sps.take()?, &self.pps.take()?)
            }
            CodecFamily::Av1 => return None,
        };

        self.config.description = Some(description);
        self.has_description = true;
        Some(self.config.clone())
    }

    /// `profile_idc`, `constraint_flags`, `level_idc` follow the NAL header
    /// byte; the codec tag becomes `avc1.<pp><cc><ll>`.
    fn update_h264_codec_string(&mut self, sps: &[u8]) {
        if sps.len() < 4 {
            return;
        }
        let profile_idc = sps[1];
        let constraints = sps[2];
        let level_idc = sps[3];
        self.config.codec = format!("avc1.{profile_idc:02x}{constraints:02x}{level_idc:02x}");
    }
}

/// AVCDecoderConfigurationRecord from one SPS and one PPS.
///
/// `01 | sps[1] | sps[2] | sps[3] | FF | E1 | u16(spsLen) | sps | 01 |
/// u16(ppsLen) | pps` — profile and level cloned from the SPS.
fn build_avcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(16 + sps.len() + pps.len());
    writer.write_u8(0x01); // configurationVersion
    writer.write_u8(sps.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    writer.write_u8(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    writer.write_u8(sps.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    writer.write_u8(0xFF); // lengthSizeMinusOne = 3
    writer.write_u8(0xE1); // one SPS
    writer.write_u16(sps.len() as u16);
    writer.write_bytes(sps);
    writer.write_u8(0x01); // one PPS
    writer.write_u16(pps.len() as u16);
    writer.write_bytes(pps);
    writer.into_vec()
}

/// HEVCDecoderConfigurationRecord: 23-byte header followed by the VPS, SPS
/// and PPS arrays in that order, one set each.
///
/// The profile byte is copied from `(sps[1]>>1)&0x3F` and the level from
/// `sps[12]` without parsing profile_tier_level.
fn build_hvcc(vps: &[u8], sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(32 + vps.len() + sps.len() + pps.len());
    writer.write_u8(0x01); // configurationVersion
    writer.write_u8(sps.get(1).map(|b| (b >> 1) & 0x3F).unwrap_or(1)); // general_profile_idc
    writer.write_u32(0); // general_profile_compatibility_flags
    writer.write_bytes(&[0; 6]); // general_constraint_indicator_flags
    writer.write_u8(sps.get(12).copied().unwrap_or(0)); // general_level_idc
    writer.write_u16(0xF000); // min_spatial_segmentation_idc + reserved
    writer.write_u8(0xFC); // parallelismType + reserved
    writer.write_u8(0xFC); // chromaFormat + reserved
    writer.write_u8(0xF8); // bitDepthLumaMinus8 + reserved
    writer.write_u8(0xF8); // bitDepthChromaMinus8 + reserved
    writer.write_u16(0); // avgFrameRate
    writer.write_u8(0x03); // lengthSizeMinusOne = 3
    writer.write_u8(3); // numOfArrays

    for (nal_type, set) in [
        (H265_NAL_VPS, vps),
        (H265_NAL_SPS, sps),
        (H265_NAL_PPS, pps),
    ] {
        writer.write_u8(nal_type);
        writer.write_u16(1); // one set per array
        writer.write_u16(set.len() as u16);
        writer.write_bytes(set);
    }

    writer.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameType;

    fn key_unit(data: Vec<u8>) -> EncodedUnit {
        EncodedUnit {
            frame_type: FrameType::Key,
            data: Bytes::from(data),
            timestamp_us: 0,
            duration_us: 16_667,
        }
    }

    fn delta_unit(data: Vec<u8>) -> EncodedUnit {
        EncodedUnit {
            frame_type: FrameType::Delta,
            data: Bytes::from(data),
            timestamp_us: 16_667,
            duration_us: 16_667,
        }
    }

    const SPS: &[u8] = &[0x67, 0x42, 0xE0, 0x1E, 0x9A];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x33];

    fn annexb(nals: &[&[u8]], four_byte: &[bool]) -> Vec<u8> {
        let mut out = Vec::new();
        for (nal, &four) in nals.iter().zip(four_byte) {
            if four {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_boundary_detection_and_chunk() {
        // Any mixture of 3- and 4-byte start codes must yield the same chunk.
        for codes in [[true, true, true], [false, true, false], [true, false, true]] {
            let mut translator = StreamTranslator::new(VideoFormat::H264);
            let unit = key_unit(annexb(&[SPS, PPS, IDR], &codes));
            let out = translator.submit_decode_unit(&unit).unwrap();

            let chunk = out.chunk.expect("keyframe produces a chunk");
            let mut expected = (IDR.len() as u32).to_be_bytes().to_vec();
            expected.extend_from_slice(IDR);
            assert_eq!(&chunk[..], &expected[..]);

            assert!(translator.has_description());
            assert!(out.configure.is_some());
        }
    }

    #[test]
    fn test_avcc_layout() {
        let mut translator = StreamTranslator::new(VideoFormat::H264);
        let unit = key_unit(annexb(&[SPS, PPS, IDR], &[true, true, true]));
        let out = translator.submit_decode_unit(&unit).unwrap();

        let config = out.configure.unwrap();
        let description = config.description.unwrap();

        let mut expected = vec![0x01, 0x42, 0xE0, 0x1E, 0xFF, 0xE1, 0x00, SPS.len() as u8];
        expected.extend_from_slice(SPS);
        expected.extend_from_slice(&[0x01, 0x00, PPS.len() as u8]);
        expected.extend_from_slice(PPS);
        assert_eq!(description, expected);
    }

    #[test]
    fn test_description_latch_persists() {
        let mut translator = StreamTranslator::new(VideoFormat::H264);

        // Delta before any reconfigure: no chunk at all.
        let out = translator
            .submit_decode_unit(&delta_unit(annexb(&[&[0x41, 0x9A]], &[true])))
            .unwrap();
        assert!(out.chunk.is_none());
        assert!(out.configure.is_none());

        let out = translator
            .submit_decode_unit(&key_unit(annexb(&[SPS, PPS, IDR], &[true, true, true])))
            .unwrap();
        assert!(out.configure.is_some());

        // A later keyframe with no parameter sets still emits its chunk.
        let out = translator
            .submit_decode_unit(&key_unit(annexb(&[IDR], &[true])))
            .unwrap();
        assert!(out.configure.is_none());
        let chunk = out.chunk.unwrap();
        assert_eq!(chunk.len(), 4 + IDR.len());

        // And deltas now pass through too.
        let out = translator
            .submit_decode_unit(&delta_unit(annexb(&[&[0x41, 0x9A]], &[false])))
            .unwrap();
        assert_eq!(out.chunk.unwrap().len(), 6);
    }

    #[test]
    fn test_codec_tag_from_sps() {
        let mut translator = StreamTranslator::new(VideoFormat::H264High8_444);
        let sps = [0x67, 0x64, 0x00, 0x32, 0xAB];
        let unit = key_unit(annexb(&[&sps, PPS, IDR], &[true, true, true]));
        let out = translator.submit_decode_unit(&unit).unwrap();
        assert_eq!(out.configure.unwrap().codec, "avc1.640032");
    }

    #[test]
    fn test_parameter_sets_only_unit() {
        let mut translator = StreamTranslator::new(VideoFormat::H264);
        let unit = key_unit(annexb(&[SPS, PPS], &[true, false]));
        let out = translator.submit_decode_unit(&unit).unwrap();
        assert_eq!(out.chunk.unwrap().len(), 0);
        assert!(out.configure.is_some());
    }

    #[test]
    fn test_hvcc_array_order() {
        let vps = [0x40, 0x01, 0x0C];
        let sps = [
            0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x5D, 0xA0,
        ];
        let pps = [0x44, 0x01, 0xC1];
        let idr = [0x26, 0x01, 0xAF]; // IDR_W_RADL
        let mut translator = StreamTranslator::new(VideoFormat::H265);
        let unit = key_unit(annexb(&[&vps, &sps, &pps, &idr], &[true, true, true, true]));
        let out = translator.submit_decode_unit(&unit).unwrap();

        let description = out.configure.unwrap().description.unwrap();
        assert_eq!(description[0], 0x01);
        assert_eq!(description[12], sps[12]); // general_level_idc heuristic
        assert_eq!(description[22], 3); // three arrays

        // VPS, SPS, PPS arrays in order, count=1 each.
        let mut at = 23;
        for (nal_type, set) in [(32u8, &vps[..]), (33, &sps[..]), (34, &pps[..])] {
            assert_eq!(description[at], nal_type);
            assert_eq!(&description[at + 1..at + 3], &[0, 1]);
            let len = u16::from_be_bytes([description[at + 3], description[at + 4]]) as usize;
            assert_eq!(len, set.len());
            assert_eq!(&description[at + 5..at + 5 + len], set);
            at += 5 + len;
        }
        assert_eq!(at, description.len());
    }

    #[test]
    fn test_h265_keyframe_missing_vps_does_not_configure() {
        let sps = [0x42, 0x01, 0x01];
        let pps = [0x44, 0x01, 0xC1];
        let idr = [0x26, 0x01, 0xAF];
        let mut translator = StreamTranslator::new(VideoFormat::H265);
        let unit = key_unit(annexb(&[&sps, &pps, &idr], &[true, true, true]));
        let out = translator.submit_decode_unit(&unit).unwrap();
        assert!(out.configure.is_none());
        assert!(!translator.has_description());
        // Chunk still forwarded.
        assert_eq!(out.chunk.unwrap().len(), 4 + idr.len());
    }

    #[test]
    fn test_cleaned_translator_refuses_mutation() {
        let mut translator = StreamTranslator::new(VideoFormat::H264);
        translator.cleanup();
        let err = translator
            .submit_decode_unit(&key_unit(annexb(&[SPS, PPS, IDR], &[true, true, true])))
            .unwrap_err();
        assert!(matches!(err, PipelineError::CleanedUp));
    }
}
