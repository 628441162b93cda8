//! Video Codec Formats
//!
//! The negotiated video formats and their codec tag strings. Hardware
//! decoders accept either the in-band tag (parameter sets travel inside the
//! bitstream) or the out-of-band tag (parameter sets delivered as an
//! AVCC/HVCC description record).

use serde::{Deserialize, Serialize};

/// Codec family, independent of profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFamily {
    H264,
    H265,
    Av1,
}

/// A concrete negotiated video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VideoFormat {
    /// H.264 constrained baseline
    H264,
    /// H.264 high 8-bit 4:4:4
    H264High8_444,
    /// H.265 main
    H265,
    /// H.265 main 10-bit
    H265Main10,
    /// H.265 range extensions 8-bit 4:4:4
    H265Rext8_444,
    /// H.265 range extensions 10-bit 4:4:4
    H265Rext10_444,
    /// AV1 main 8-bit
    Av1Main8,
    /// AV1 main 10-bit
    Av1Main10,
    /// AV1 high 8-bit 4:4:4
    Av1High8_444,
    /// AV1 high 10-bit 4:4:4
    Av1High10_444,
}

impl VideoFormat {
    pub fn all() -> &'static [VideoFormat] {
        &[
            VideoFormat::H264,
            VideoFormat::H264High8_444,
            VideoFormat::H265,
            VideoFormat::H265Main10,
            VideoFormat::H265Rext8_444,
            VideoFormat::H265Rext10_444,
            VideoFormat::Av1Main8,
            VideoFormat::Av1Main10,
            VideoFormat::Av1High8_444,
            VideoFormat::Av1High10_444,
        ]
    }

    pub fn family(&self) -> CodecFamily {
        match self {
            VideoFormat::H264 | VideoFormat::H264High8_444 => CodecFamily::H264,
            VideoFormat::H265
            | VideoFormat::H265Main10
            | VideoFormat::H265Rext8_444
            | VideoFormat::H265Rext10_444 => CodecFamily::H265,
            VideoFormat::Av1Main8
            | VideoFormat::Av1Main10
            | VideoFormat::Av1High8_444
            | VideoFormat::Av1High10_444 => CodecFamily::Av1,
        }
    }

    /// Codec tag for the in-band profile (parameter sets inside the stream).
    pub fn in_band_codec(&self) -> &'static str {
        match self {
            VideoFormat::H264 => "avc3.42E01E",
            VideoFormat::H264High8_444 => "avc3.640032",
            VideoFormat::H265 => "hev1.1.6.L93.B0",
            VideoFormat::H265Main10 => "hev1.2.4.L120.90",
            VideoFormat::H265Rext8_444 => "hev1.6.6.L93.90",
            VideoFormat::H265Rext10_444 => "hev1.6.10.L120.90",
            VideoFormat::Av1Main8 => "av01.0.04M.08",
            VideoFormat::Av1Main10 => "av01.0.04M.10",
            VideoFormat::Av1High8_444 => "av01.0.08M.08",
            VideoFormat::Av1High10_444 => "av01.0.08M.10",
        }
    }

    /// Codec tag for the out-of-band profile (AVCC/HVCC description record).
    /// AV1 carries its sequence header in-band either way.
    pub fn out_of_band_codec(&self) -> &'static str {
        match self {
            VideoFormat::H264 => "avc1.42E01E",
            VideoFormat::H264High8_444 => "avc1.640032",
            VideoFormat::H265 => "hvc1.1.6.L93.B0",
            VideoFormat::H265Main10 => "hvc1.2.4.L120.90",
            VideoFormat::H265Rext8_444 => "hvc1.6.6.L93.90",
            VideoFormat::H265Rext10_444 => "hvc1.6.10.L120.90",
            VideoFormat::Av1Main8 => "av01.0.04M.08",
            VideoFormat::Av1Main10 => "av01.0.04M.10",
            VideoFormat::Av1High8_444 => "av01.0.08M.08",
            VideoFormat::Av1High10_444 => "av01.0.08M.10",
        }
    }

    /// Whether the out-of-band profile differs from the in-band one and
    /// therefore needs the Annex-B translator attached.
    pub fn has_out_of_band_variant(&self) -> bool {
        !matches!(self.family(), CodecFamily::Av1)
    }

    /// 4:4:4 chroma formats (subject to the decode policy knob).
    pub fn is_444(&self) -> bool {
        matches!(
            self,
            VideoFormat::H264High8_444
                | VideoFormat::H265Rext8_444
                | VideoFormat::H265Rext10_444
                | VideoFormat::Av1High8_444
                | VideoFormat::Av1High10_444
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            VideoFormat::H264 => "H.264",
            VideoFormat::H264High8_444 => "H.264 4:4:4",
            VideoFormat::H265 => "H.265",
            VideoFormat::H265Main10 => "H.265 10-bit",
            VideoFormat::H265Rext8_444 => "H.265 4:4:4",
            VideoFormat::H265Rext10_444 => "H.265 10-bit 4:4:4",
            VideoFormat::Av1Main8 => "AV1",
            VideoFormat::Av1Main10 => "AV1 10-bit",
            VideoFormat::Av1High8_444 => "AV1 4:4:4",
            VideoFormat::Av1High10_444 => "AV1 10-bit 4:4:4",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_band_tags_swap_prefix_only() {
        assert_eq!(VideoFormat::H264High8_444.out_of_band_codec(), "avc1.640032");
        assert_eq!(VideoFormat::H265.out_of_band_codec(), "hvc1.1.6.L93.B0");
        for format in VideoFormat::all() {
            let in_band = format.in_band_codec();
            let out = format.out_of_band_codec();
            if format.family() == CodecFamily::Av1 {
                assert_eq!(in_band, out);
            } else {
                assert_eq!(in_band[4..], out[4..]);
                assert_ne!(in_band[..4], out[..4]);
            }
        }
    }
}
