//! Fragmented MP4 Emitter and Source Buffer Sink
//!
//! Legacy fallback for environments with no direct decoder: encoded units
//! are wrapped into an ISO-BMFF stream (one init segment, then one
//! `moof`+`mdat` pair per unit) and appended to a media-source style buffer
//! that applies backpressure through an `updating` flag.

use std::collections::VecDeque;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Pipe, PipePayload, PipeState};
use crate::error::PipelineError;
use crate::media::{EncodedUnit, StreamConfig, StreamTranslator};
use crate::utils::ByteWriter;

const TIMESCALE: u32 = 1_000_000; // microseconds
const TRACK_ID: u32 = 1;
/// Consecutive delta drops while waiting for a keyframe before asking for one.
const DROPS_BEFORE_IDR_REQUEST: u32 = 60;
/// Units parked while setup has not completed yet.
const PENDING_LIMIT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// `ftyp` + `moov`; implies a fresh source buffer.
    Init,
    /// One `moof` + `mdat` pair.
    Media,
}

/// A chunk of the synthesized ISO-BMFF stream.
#[derive(Debug, Clone)]
pub struct MediaSegment {
    pub kind: SegmentKind,
    pub data: Bytes,
    /// `mfhd` sequence number; 0 for init segments.
    pub sequence: u32,
    pub codec: String,
}

/// Emits an init segment on the first keyframe and a fragment per unit.
pub struct Fmp4EmitterPipe {
    base: Box<dyn Pipe>,
    state: PipeState,
    translator: StreamTranslator,
    pending: VecDeque<EncodedUnit>,
    sequence_number: u32,
    base_timestamp: Option<u64>,
    last_decode_time: Option<u64>,
    timestamp_offset: u64,
    awaiting_keyframe: bool,
    consecutive_drops: u32,
    /// Pending report, consumed by one `poll_request_idr`.
    request_idr: bool,
    /// Latched until the next keyframe so the request fires once.
    idr_requested: bool,
    width: u32,
    height: u32,
    fps: u32,
}

impl Fmp4EmitterPipe {
    pub fn new(base: Box<dyn Pipe>, format: crate::media::VideoFormat) -> Self {
        Self {
            base,
            state: PipeState::Unconfigured,
            translator: StreamTranslator::new(format),
            pending: VecDeque::new(),
            sequence_number: 0,
            base_timestamp: None,
            last_decode_time: None,
            timestamp_offset: 0,
            awaiting_keyframe: true,
            consecutive_drops: 0,
            request_idr: false,
            idr_requested: false,
            width: 0,
            height: 0,
            fps: 60,
        }
    }

    fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.fps.max(1) as u64
    }

    fn process_unit(&mut self, unit: EncodedUnit) {
        if unit.is_key() {
            self.awaiting_keyframe = false;
            self.consecutive_drops = 0;
            self.request_idr = false;
            self.idr_requested = false;
        } else if self.awaiting_keyframe {
            self.consecutive_drops += 1;
            if self.consecutive_drops >= DROPS_BEFORE_IDR_REQUEST && !self.idr_requested {
                warn!(
                    "dropped {} delta units while waiting for a keyframe, requesting IDR",
                    self.consecutive_drops
                );
                self.idr_requested = true;
                self.request_idr = true;
            }
            return;
        }

        let output = match self.translator.submit_decode_unit(&unit) {
            Ok(output) => output,
            Err(err) => {
                debug!("fmp4 emitter dropping unit: {err}");
                return;
            }
        };

        if let Some(config) = output.configure {
            if let Some(description) = config.description.as_deref() {
                let init = build_init_segment(description, self.width, self.height);
                info!(
                    "fmp4 emitter: new init segment ({} bytes) for {}",
                    init.len(),
                    config.codec
                );
                // A fresh source buffer starts a fresh fragment sequence.
                self.sequence_number = 0;
                self.base.submit(PipePayload::Segment(MediaSegment {
                    kind: SegmentKind::Init,
                    data: Bytes::from(init),
                    sequence: 0,
                    codec: config.codec.clone(),
                }));
            }
        }

        let Some(chunk) = output.chunk else { return };
        if !self.translator.has_description() {
            // No init segment yet; nothing downstream could decode this.
            return;
        }
        if chunk.is_empty() {
            return; // parameter sets only
        }

        let decode_time = self.repair_timestamp(&unit);
        let duration = if unit.duration_us > 0 {
            unit.duration_us
        } else {
            self.frame_interval_us()
        };

        self.sequence_number += 1;
        let fragment = build_media_segment(
            self.sequence_number,
            decode_time,
            duration as u32,
            unit.is_key(),
            &chunk,
        );
        self.base.submit(PipePayload::Segment(MediaSegment {
            kind: SegmentKind::Media,
            data: Bytes::from(fragment),
            sequence: self.sequence_number,
            codec: self.translator.config().codec.clone(),
        }));
    }

    /// Shift onto the first keyframe's timebase and enforce monotonicity:
    /// a timestamp that does not advance is bumped past the previous one by
    /// one frame interval, and the bump sticks for everything after it.
    fn repair_timestamp(&mut self, unit: &EncodedUnit) -> u64 {
        let base = *self.base_timestamp.get_or_insert(unit.timestamp_us);
        let mut decode_time = unit.timestamp_us.saturating_sub(base) + self.timestamp_offset;

        if let Some(last) = self.last_decode_time {
            if decode_time <= last {
                let bump = self.frame_interval_us();
                decode_time = last + bump;
                self.timestamp_offset += bump;
            }
        }

        self.last_decode_time = Some(decode_time);
        decode_time
    }
}

impl Pipe for Fmp4EmitterPipe {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        self.base.setup(config)?;
        self.width = config.width;
        self.height = config.height;
        self.fps = config.fps;
        self.state = PipeState::Configured;

        while let Some(unit) = self.pending.pop_front() {
            self.process_unit(unit);
        }
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        let kind = payload.kind();
        let PipePayload::EncodedVideo(unit) = payload else {
            warn!("fmp4 emitter ignoring {kind:?} payload");
            return;
        };

        match self.state {
            PipeState::Unconfigured => {
                if self.pending.len() >= PENDING_LIMIT {
                    warn!("fmp4 emitter pending queue full, dropping unit");
                    return;
                }
                self.pending.push_back(unit);
            }
            PipeState::Configured => self.process_unit(unit),
            PipeState::Errored | PipeState::Cleaned => {}
        }
    }

    fn poll_request_idr(&mut self) -> bool {
        let own = std::mem::take(&mut self.request_idr);
        own | self.base.poll_request_idr()
    }

    fn cleanup(&mut self) {
        self.translator.cleanup();
        self.pending.clear();
        self.state = PipeState::Cleaned;
        self.base.cleanup();
    }
}

// --- ISO-BMFF box helpers -------------------------------------------------

fn box_start(writer: &mut ByteWriter, fourcc: &[u8; 4]) -> usize {
    let at = writer.position();
    writer.write_u32(0); // patched by box_end
    writer.write_fourcc(fourcc);
    at
}

fn full_box_start(writer: &mut ByteWriter, fourcc: &[u8; 4], version: u8, flags: u32) -> usize {
    let at = box_start(writer, fourcc);
    writer.write_u8(version);
    writer.write_u24(flags);
    at
}

fn box_end(writer: &mut ByteWriter, at: usize) {
    writer.patch_u32_at(at, (writer.position() - at) as u32);
}

/// `ftyp` + `moov` for a single fragmented video track.
fn build_init_segment(description: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(1024);

    let ftyp = box_start(&mut w, b"ftyp");
    w.write_str("isom");
    w.write_u32(0x200);
    w.write_str("isom");
    w.write_str("iso6");
    w.write_str("avc1");
    w.write_str("mp41");
    box_end(&mut w, ftyp);

    let moov = box_start(&mut w, b"moov");
    {
        let mvhd = full_box_start(&mut w, b"mvhd", 0, 0);
        w.write_u32(0); // creation_time
        w.write_u32(0); // modification_time
        w.write_u32(TIMESCALE);
        w.write_u32(0); // duration: unknown, fragments extend it
        w.write_u32(0x0001_0000); // rate 1.0
        w.write_u16(0x0100); // volume 1.0
        w.write_u16(0); // reserved
        w.write_u32(0);
        w.write_u32(0);
        write_identity_matrix(&mut w);
        for _ in 0..6 {
            w.write_u32(0); // pre_defined
        }
        w.write_u32(TRACK_ID + 1); // next_track_ID
        box_end(&mut w, mvhd);

        let trak = box_start(&mut w, b"trak");
        {
            let tkhd = full_box_start(&mut w, b"tkhd", 0, 0x3); // enabled | in movie
            w.write_u32(0); // creation_time
            w.write_u32(0); // modification_time
            w.write_u32(TRACK_ID);
            w.write_u32(0); // reserved
            w.write_u32(0); // duration
            w.write_u32(0); // reserved
            w.write_u32(0);
            w.write_u16(0); // layer
            w.write_u16(0); // alternate_group
            w.write_u16(0); // volume: video track
            w.write_u16(0); // reserved
            write_identity_matrix(&mut w);
            w.write_u32(width << 16); // 16.16 fixed
            w.write_u32(height << 16);
            box_end(&mut w, tkhd);

            let mdia = box_start(&mut w, b"mdia");
            {
                let mdhd = full_box_start(&mut w, b"mdhd", 0, 0);
                w.write_u32(0);
                w.write_u32(0);
                w.write_u32(TIMESCALE);
                w.write_u32(0);
                w.write_u16(0x55C4); // language: und
                w.write_u16(0); // pre_defined
                box_end(&mut w, mdhd);

                let hdlr = full_box_start(&mut w, b"hdlr", 0, 0);
                w.write_u32(0); // pre_defined
                w.write_str("vide");
                w.write_u32(0);
                w.write_u32(0);
                w.write_u32(0);
                w.write_str("VideoHandler");
                w.write_u8(0);
                box_end(&mut w, hdlr);

                let minf = box_start(&mut w, b"minf");
                {
                    let vmhd = full_box_start(&mut w, b"vmhd", 0, 1);
                    w.write_u16(0); // graphicsmode
                    w.write_u16(0); // opcolor
                    w.write_u16(0);
                    w.write_u16(0);
                    box_end(&mut w, vmhd);

                    let dinf = box_start(&mut w, b"dinf");
                    {
                        let dref = full_box_start(&mut w, b"dref", 0, 0);
                        w.write_u32(1); // entry_count
                        let url = full_box_start(&mut w, b"url ", 0, 1); // self-contained
                        box_end(&mut w, url);
                        box_end(&mut w, dref);
                    }
                    box_end(&mut w, dinf);

                    let stbl = box_start(&mut w, b"stbl");
                    {
                        let stsd = full_box_start(&mut w, b"stsd", 0, 0);
                        w.write_u32(1); // entry_count
                        write_avc1_entry(&mut w, description, width, height);
                        box_end(&mut w, stsd);

                        let stts = full_box_start(&mut w, b"stts", 0, 0);
                        w.write_u32(0);
                        box_end(&mut w, stts);

                        let stsc = full_box_start(&mut w, b"stsc", 0, 0);
                        w.write_u32(0);
                        box_end(&mut w, stsc);

                        let stsz = full_box_start(&mut w, b"stsz", 0, 0);
                        w.write_u32(0); // sample_size
                        w.write_u32(0); // sample_count
                        box_end(&mut w, stsz);

                        let stco = full_box_start(&mut w, b"stco", 0, 0);
                        w.write_u32(0);
                        box_end(&mut w, stco);
                    }
                    box_end(&mut w, stbl);
                }
                box_end(&mut w, minf);
            }
            box_end(&mut w, mdia);
        }
        box_end(&mut w, trak);

        let mvex = box_start(&mut w, b"mvex");
        {
            let trex = full_box_start(&mut w, b"trex", 0, 0);
            w.write_u32(TRACK_ID);
            w.write_u32(1); // default_sample_description_index
            w.write_u32(0); // default_sample_duration
            w.write_u32(0); // default_sample_size
            w.write_u32(0); // default_sample_flags
            box_end(&mut w, trex);
        }
        box_end(&mut w, mvex);
    }
    box_end(&mut w, moov);

    w.into_vec()
}

fn write_identity_matrix(w: &mut ByteWriter) {
    for value in [
        0x0001_0000u32, 0, 0, //
        0, 0x0001_0000, 0, //
        0, 0, 0x4000_0000,
    ] {
        w.write_u32(value);
    }
}

fn write_avc1_entry(w: &mut ByteWriter, description: &[u8], width: u32, height: u32) {
    let avc1 = box_start(w, b"avc1");
    w.write_bytes(&[0; 6]); // reserved
    w.write_u16(1); // data_reference_index
    w.write_u16(0); // pre_defined
    w.write_u16(0); // reserved
    for _ in 0..3 {
        w.write_u32(0); // pre_defined
    }
    w.write_u16(width as u16);
    w.write_u16(height as u16);
    w.write_u32(0x0048_0000); // horizresolution 72 dpi
    w.write_u32(0x0048_0000); // vertresolution
    w.write_u32(0); // reserved
    w.write_u16(1); // frame_count
    w.write_bytes(&[0; 32]); // compressorname
    w.write_u16(0x0018); // depth
    w.write_u16(0xFFFF); // pre_defined

    let avcc = box_start(w, b"avcC");
    w.write_bytes(description);
    box_end(w, avcc);

    box_end(w, avc1);
}

/// Sync-sample flags vs. non-sync delta flags for `trun`.
const SAMPLE_FLAGS_KEY: u32 = 0x0200_0000; // depends_on: no
const SAMPLE_FLAGS_DELTA: u32 = 0x0101_0000; // depends_on: yes, non-sync

/// One `moof` + `mdat` pair carrying a single sample.
fn build_media_segment(
    sequence: u32,
    decode_time: u64,
    duration: u32,
    key: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(256 + payload.len());

    let moof = box_start(&mut w, b"moof");
    let trun_data_offset_at;
    {
        let mfhd = full_box_start(&mut w, b"mfhd", 0, 0);
        w.write_u32(sequence);
        box_end(&mut w, mfhd);

        let traf = box_start(&mut w, b"traf");
        {
            // default-base-is-moof: offsets are relative to the moof start.
            let tfhd = full_box_start(&mut w, b"tfhd", 0, 0x0002_0000);
            w.write_u32(TRACK_ID);
            box_end(&mut w, tfhd);

            let tfdt = full_box_start(&mut w, b"tfdt", 1, 0);
            w.write_u64(decode_time);
            box_end(&mut w, tfdt);

            // data-offset | sample-duration | sample-size | sample-flags
            let trun = full_box_start(&mut w, b"trun", 0, 0x0000_0701);
            w.write_u32(1); // sample_count
            trun_data_offset_at = w.position();
            w.write_u32(0); // data_offset, patched below
            w.write_u32(duration);
            w.write_u32(payload.len() as u32);
            w.write_u32(if key { SAMPLE_FLAGS_KEY } else { SAMPLE_FLAGS_DELTA });
            box_end(&mut w, trun);
        }
        box_end(&mut w, traf);
    }
    box_end(&mut w, moof);

    let mdat_start = w.position();
    let mdat = box_start(&mut w, b"mdat");
    w.write_bytes(payload);
    box_end(&mut w, mdat);

    // First sample byte relative to the moof start (the moof sits at 0 here).
    w.patch_u32_at(trun_data_offset_at, (mdat_start + 8) as u32);

    w.into_vec()
}

// --- Source buffer sink ---------------------------------------------------

/// Events delivered to whatever plays the synthesized stream.
#[derive(Debug)]
pub enum SourceBufferEvent {
    /// Tear down the previous buffer, if any, and start a new one.
    Create { codec: String },
    Append(MediaSegment),
    Remove,
}

struct SinkShared {
    queue: VecDeque<MediaSegment>,
    updating: bool,
    tx: mpsc::UnboundedSender<SourceBufferEvent>,
    errored: bool,
}

impl SinkShared {
    /// Append the next queued segment if the buffer is idle.
    fn pump(&mut self) {
        if self.updating || self.errored {
            return;
        }
        if let Some(segment) = self.queue.pop_front() {
            self.updating = true;
            if self.tx.send(SourceBufferEvent::Append(segment)).is_err() {
                self.errored = true;
            }
        }
    }
}

/// Completion handle given to the consumer; signals `updateend`.
#[derive(Clone)]
pub struct SourceBufferHandle {
    shared: Arc<Mutex<SinkShared>>,
}

impl SourceBufferHandle {
    /// The consumer finished applying the previous append.
    pub fn update_end(&self) {
        let mut shared = self.shared.lock();
        shared.updating = false;
        shared.pump();
    }
}

/// Terminal pipe feeding a media-source style buffer.
///
/// Appends happen only while the consumer's update flag is clear; segments
/// queue in between and `update_end` drives the next append. An init
/// segment replaces the source buffer wholesale.
pub struct SourceBufferSink {
    shared: Arc<Mutex<SinkShared>>,
    state: PipeState,
    has_buffer: bool,
}

impl SourceBufferSink {
    pub fn new(
        tx: mpsc::UnboundedSender<SourceBufferEvent>,
    ) -> (Self, SourceBufferHandle) {
        let shared = Arc::new(Mutex::new(SinkShared {
            queue: VecDeque::new(),
            updating: false,
            tx,
            errored: false,
        }));
        (
            Self {
                shared: shared.clone(),
                state: PipeState::Unconfigured,
                has_buffer: false,
            },
            SourceBufferHandle { shared },
        )
    }
}

impl Pipe for SourceBufferSink {
    fn setup(&mut self, _config: &StreamConfig) -> Result<(), PipelineError> {
        self.state = PipeState::Configured;
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        if self.state == PipeState::Cleaned || self.state == PipeState::Errored {
            return;
        }
        let kind = payload.kind();
        let PipePayload::Segment(segment) = payload else {
            warn!("source buffer sink ignoring {kind:?} payload");
            return;
        };

        let mut shared = self.shared.lock();
        if segment.kind == SegmentKind::Init {
            if self.has_buffer {
                // The stale buffer goes away before its replacement exists.
                shared.queue.clear();
                shared.updating = false;
                if shared.tx.send(SourceBufferEvent::Remove).is_err() {
                    shared.errored = true;
                }
            }
            if shared
                .tx
                .send(SourceBufferEvent::Create {
                    codec: segment.codec.clone(),
                })
                .is_err()
            {
                shared.errored = true;
            }
            self.has_buffer = true;
        }

        shared.queue.push_back(segment);
        shared.pump();

        if shared.errored {
            self.state = PipeState::Errored;
            warn!("source buffer consumer went away, sink errored");
        }
    }

    fn cleanup(&mut self) {
        let mut shared = self.shared.lock();
        shared.queue.clear();
        if self.has_buffer {
            let _ = shared.tx.send(SourceBufferEvent::Remove);
        }
        drop(shared);
        self.state = PipeState::Cleaned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameType, VideoFormat};

    const SPS: &[u8] = &[0x67, 0x42, 0xE0, 0x1E, 0x9A];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00, 0x33];
    const P_SLICE: &[u8] = &[0x41, 0x9A, 0x02];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    fn unit(frame_type: FrameType, data: Vec<u8>, timestamp_us: u64) -> EncodedUnit {
        EncodedUnit {
            frame_type,
            data: Bytes::from(data),
            timestamp_us,
            duration_us: 0,
        }
    }

    /// Collects segments instead of a real source buffer.
    struct SegmentProbe {
        segments: Arc<Mutex<Vec<MediaSegment>>>,
    }

    impl Pipe for SegmentProbe {
        fn setup(&mut self, _config: &StreamConfig) -> Result<(), PipelineError> {
            Ok(())
        }
        fn submit(&mut self, payload: PipePayload) {
            if let PipePayload::Segment(segment) = payload {
                self.segments.lock().push(segment);
            }
        }
        fn cleanup(&mut self) {}
    }

    fn emitter_with_probe() -> (Fmp4EmitterPipe, Arc<Mutex<Vec<MediaSegment>>>) {
        let segments = Arc::new(Mutex::new(Vec::new()));
        let probe = SegmentProbe {
            segments: segments.clone(),
        };
        let mut pipe = Fmp4EmitterPipe::new(Box::new(probe), VideoFormat::H264);
        pipe.setup(&StreamConfig::new(VideoFormat::H264, 1280, 720, 60))
            .unwrap();
        (pipe, segments)
    }

    /// Walk the top-level boxes of a segment: `(fourcc, offset, total len)`.
    fn boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
        let mut reader = crate::utils::ByteReader::new(data);
        let mut out = Vec::new();
        while reader.remaining() >= 8 {
            let at = reader.position();
            let len = reader.read_u32().unwrap() as usize;
            let fourcc = String::from_utf8_lossy(reader.read_bytes(4).unwrap()).into_owned();
            assert!(len >= 8, "degenerate box length");
            assert!(reader.skip(len - 8).is_some(), "box length overruns segment");
            out.push((fourcc, at, len));
        }
        assert_eq!(reader.remaining(), 0, "trailing bytes after last box");
        out
    }

    fn find_box<'d>(data: &'d [u8], path: &[&str]) -> Option<&'d [u8]> {
        let (first, rest) = path.split_first()?;
        for (fourcc, at, len) in boxes(data) {
            if fourcc == *first {
                let body = &data[at + 8..at + len];
                return if rest.is_empty() {
                    Some(body)
                } else {
                    find_box(body, rest)
                };
            }
        }
        None
    }

    #[test]
    fn test_init_segment_box_tree_and_lengths() {
        let (mut pipe, segments) = emitter_with_probe();
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            0,
        )));

        let segments = segments.lock();
        assert_eq!(segments[0].kind, SegmentKind::Init);
        let init = &segments[0].data;

        let top: Vec<String> = boxes(init).into_iter().map(|b| b.0).collect();
        assert_eq!(top, vec!["ftyp", "moov"]);

        // ftyp brands
        let ftyp = find_box(init, &["ftyp"]).unwrap();
        assert_eq!(&ftyp[..4], b"isom");
        assert_eq!(u32::from_be_bytes(ftyp[4..8].try_into().unwrap()), 0x200);
        assert_eq!(&ftyp[8..], b"isomiso6avc1mp41");

        // The full moov spine must resolve.
        for path in [
            &["moov", "mvhd"][..],
            &["moov", "trak", "tkhd"],
            &["moov", "trak", "mdia", "mdhd"],
            &["moov", "trak", "mdia", "hdlr"],
            &["moov", "trak", "mdia", "minf", "vmhd"],
            &["moov", "trak", "mdia", "minf", "dinf", "dref"],
            &["moov", "trak", "mdia", "minf", "stbl", "stsd"],
            &["moov", "trak", "mdia", "minf", "stbl", "stts"],
            &["moov", "trak", "mdia", "minf", "stbl", "stsz"],
            &["moov", "trak", "mdia", "minf", "stbl", "stco"],
            &["moov", "mvex", "trex"],
        ] {
            assert!(find_box(init, path).is_some(), "missing box {path:?}");
        }

        // The avcC record inside stsd matches the translator's description.
        let stsd = find_box(init, &["moov", "trak", "mdia", "minf", "stbl", "stsd"]).unwrap();
        let avc1_body = find_box(&stsd[8..], &["avc1"]).unwrap(); // skip version+entry_count
        let avcc = find_box(&avc1_body[78..], &["avcC"]).unwrap(); // skip sample entry fields
        assert_eq!(avcc[0], 0x01);
        assert_eq!(avcc[1], 0x42);

        // mdhd timescale is microseconds.
        let mdhd = find_box(init, &["moov", "trak", "mdia", "mdhd"]).unwrap();
        assert_eq!(u32::from_be_bytes(mdhd[12..16].try_into().unwrap()), TIMESCALE);
    }

    fn tfdt_of(segment: &MediaSegment) -> u64 {
        let tfdt = find_box(&segment.data, &["moof", "traf", "tfdt"]).unwrap();
        assert_eq!(tfdt[0], 1); // version 1: 64-bit time
        u64::from_be_bytes(tfdt[4..12].try_into().unwrap())
    }

    fn mfhd_of(segment: &MediaSegment) -> u32 {
        let mfhd = find_box(&segment.data, &["moof", "mfhd"]).unwrap();
        u32::from_be_bytes(mfhd[4..8].try_into().unwrap())
    }

    #[test]
    fn test_sequence_numbers_and_tfdt_monotonic() {
        let (mut pipe, segments) = emitter_with_probe();
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            1_000_000, // nonzero stream start becomes the zero point
        )));
        for i in 1..60u64 {
            pipe.submit(PipePayload::EncodedVideo(unit(
                FrameType::Delta,
                annexb(&[P_SLICE]),
                1_000_000 + i * 16_667,
            )));
        }

        let segments = segments.lock();
        assert_eq!(segments.len(), 61); // one init + 60 fragments
        assert_eq!(segments[0].kind, SegmentKind::Init);

        let mut last_tfdt = None;
        for (i, segment) in segments[1..].iter().enumerate() {
            assert_eq!(segment.kind, SegmentKind::Media);
            assert_eq!(mfhd_of(segment), i as u32 + 1);
            let tfdt = tfdt_of(segment);
            if let Some(last) = last_tfdt {
                assert!(tfdt > last, "tfdt not strictly increasing");
            } else {
                assert_eq!(tfdt, 0, "first fragment decode time must be zero");
            }
            last_tfdt = Some(tfdt);
        }
    }

    #[test]
    fn test_monotonic_timestamp_repair() {
        let (mut pipe, segments) = emitter_with_probe();
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            0,
        )));
        for ts in [16_667u64, 16_666, 40_000] {
            pipe.submit(PipePayload::EncodedVideo(unit(
                FrameType::Delta,
                annexb(&[P_SLICE]),
                ts,
            )));
        }

        let segments = segments.lock();
        let times: Vec<u64> = segments[1..].iter().map(tfdt_of).collect();
        assert_eq!(times, vec![0, 16_667, 16_667 + 16_666, 40_000 + 16_666]);
    }

    #[test]
    fn test_trun_data_offset_points_at_payload() {
        let (mut pipe, segments) = emitter_with_probe();
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            0,
        )));

        let segments = segments.lock();
        let fragment = &segments[1].data;
        let trun = find_box(fragment, &["moof", "traf", "trun"]).unwrap();
        // version/flags(4) + sample_count(4), then data_offset
        let data_offset = u32::from_be_bytes(trun[8..12].try_into().unwrap()) as usize;

        // moof starts at 0, so the offset lands just past the mdat header.
        let (_, moof_at, moof_len) = boxes(fragment)
            .into_iter()
            .find(|(fourcc, ..)| fourcc == "moof")
            .unwrap();
        assert_eq!(moof_at, 0);
        assert_eq!(data_offset, moof_len + 8);

        // And the bytes there are the length-prefixed IDR.
        let expected_len = u32::from_be_bytes(
            fragment[data_offset..data_offset + 4].try_into().unwrap(),
        ) as usize;
        assert_eq!(expected_len, IDR.len());
        assert_eq!(&fragment[data_offset + 4..data_offset + 4 + expected_len], IDR);
    }

    #[test]
    fn test_delta_drop_accounting_requests_idr() {
        let (mut pipe, segments) = emitter_with_probe();
        for i in 0..59u64 {
            pipe.submit(PipePayload::EncodedVideo(unit(
                FrameType::Delta,
                annexb(&[P_SLICE]),
                i * 16_667,
            )));
        }
        assert!(!pipe.poll_request_idr());
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Delta,
            annexb(&[P_SLICE]),
            60 * 16_667,
        )));
        assert!(pipe.poll_request_idr());
        // Reported once; further drops do not re-arm while latched.
        assert!(!pipe.poll_request_idr());
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Delta,
            annexb(&[P_SLICE]),
            61 * 16_667,
        )));
        assert!(!pipe.poll_request_idr());
        assert!(segments.lock().is_empty());

        // The next keyframe clears the latch and starts the stream.
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            62 * 16_667,
        )));
        assert!(!pipe.idr_requested);
        assert_eq!(segments.lock().len(), 2);
    }

    #[test]
    fn test_reconfiguration_restarts_sequence() {
        let (mut pipe, segments) = emitter_with_probe();
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            0,
        )));
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Delta,
            annexb(&[P_SLICE]),
            16_667,
        )));
        // New parameter sets: fresh init segment, fresh sequence numbering.
        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            33_334,
        )));

        let segments = segments.lock();
        let kinds: Vec<SegmentKind> = segments.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Init,
                SegmentKind::Media,
                SegmentKind::Media,
                SegmentKind::Init,
                SegmentKind::Media
            ]
        );
        assert_eq!(mfhd_of(&segments[4]), 1);
    }

    #[test]
    fn test_pre_setup_units_are_buffered() {
        let segments = Arc::new(Mutex::new(Vec::new()));
        let probe = SegmentProbe {
            segments: segments.clone(),
        };
        let mut pipe = Fmp4EmitterPipe::new(Box::new(probe), VideoFormat::H264);

        pipe.submit(PipePayload::EncodedVideo(unit(
            FrameType::Key,
            annexb(&[SPS, PPS, IDR]),
            0,
        )));
        assert!(segments.lock().is_empty());

        pipe.setup(&StreamConfig::new(VideoFormat::H264, 1280, 720, 60))
            .unwrap();
        assert_eq!(segments.lock().len(), 2); // init + fragment drained
    }

    #[test]
    fn test_source_buffer_backpressure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut sink, handle) = SourceBufferSink::new(tx);
        sink.setup(&StreamConfig::new(VideoFormat::H264, 1280, 720, 60))
            .unwrap();

        let segment = |kind, sequence| MediaSegment {
            kind,
            data: Bytes::from_static(b"x"),
            sequence,
            codec: "avc1.42e01e".to_string(),
        };

        sink.submit(PipePayload::Segment(segment(SegmentKind::Init, 0)));
        sink.submit(PipePayload::Segment(segment(SegmentKind::Media, 1)));
        sink.submit(PipePayload::Segment(segment(SegmentKind::Media, 2)));

        // Create, then exactly one append until update_end is signalled.
        assert!(matches!(rx.try_recv().unwrap(), SourceBufferEvent::Create { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SourceBufferEvent::Append(MediaSegment { sequence: 0, .. })
        ));
        assert!(rx.try_recv().is_err());

        handle.update_end();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SourceBufferEvent::Append(MediaSegment { sequence: 1, .. })
        ));
        assert!(rx.try_recv().is_err());

        handle.update_end();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SourceBufferEvent::Append(MediaSegment { sequence: 2, .. })
        ));

        // A new init segment replaces the buffer.
        sink.submit(PipePayload::Segment(segment(SegmentKind::Init, 0)));
        handle.update_end();
        assert!(matches!(rx.try_recv().unwrap(), SourceBufferEvent::Remove));
        assert!(matches!(rx.try_recv().unwrap(), SourceBufferEvent::Create { .. }));
    }
}
