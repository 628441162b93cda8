//! Audio Pipes
//!
//! The audio path mirrors the video pipe design at small scale: a decode
//! pipe turns Opus packets into interleaved PCM, and a sink plays it
//! through cpal behind a lock-free-enough ring buffer.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc};
use std::thread;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::{Pipe, PipePayload, PipeState};
use crate::error::PipelineError;
use crate::media::{AudioConfig, AudioPacket, MultistreamDecoder, PcmBlock, StreamConfig};

/// Packets parked before `setup` completes.
const PENDING_LIMIT: usize = 256;

/// Decodes Opus packets into PCM blocks for the sink below.
pub struct AudioDecoderPipe {
    base: Box<dyn Pipe>,
    state: PipeState,
    decoder: Option<MultistreamDecoder>,
    audio: Option<AudioConfig>,
    pending: VecDeque<AudioPacket>,
}

impl AudioDecoderPipe {
    pub fn new(base: Box<dyn Pipe>) -> Self {
        Self {
            base,
            state: PipeState::Unconfigured,
            decoder: None,
            audio: None,
            pending: VecDeque::new(),
        }
    }

    fn decode_packet(&mut self, input: Option<&[u8]>) {
        let (Some(decoder), Some(audio)) = (self.decoder.as_mut(), self.audio.as_ref()) else {
            return;
        };
        let frame_size = audio.samples_per_frame as usize;
        let channels = audio.channels as usize;
        let mut samples = vec![0f32; channels * frame_size];

        match decoder.decode(input, &mut samples, frame_size, false) {
            Ok(decoded) => {
                samples.truncate(decoded * channels);
                self.base.submit(PipePayload::Pcm(PcmBlock {
                    samples,
                    channels: audio.channels,
                    sample_rate: audio.sample_rate,
                }));
            }
            Err(status) => {
                debug!("opus decode failed with status {}", status.code());
            }
        }
    }

    /// No packet arrived in time: synthesize a concealment frame.
    pub fn conceal_loss(&mut self) {
        if self.state == PipeState::Configured {
            self.decode_packet(None);
        }
    }
}

impl Pipe for AudioDecoderPipe {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        let audio = config
            .audio
            .clone()
            .ok_or(PipelineError::Unsupported("no audio configuration"))?;

        self.base.setup(config)?;
        let decoder = MultistreamDecoder::new(&audio).map_err(|status| {
            PipelineError::Configuration(format!("opus decoder status {}", status.code()))
        })?;
        info!(
            "audio decoder ready: {} ch @ {} Hz, {} samples/frame",
            audio.channels, audio.sample_rate, audio.samples_per_frame
        );
        self.decoder = Some(decoder);
        self.audio = Some(audio);
        self.state = PipeState::Configured;

        while let Some(packet) = self.pending.pop_front() {
            self.decode_packet(Some(&packet.data));
        }
        Ok(())
    }

    fn submit(&mut self, payload: PipePayload) {
        let kind = payload.kind();
        let PipePayload::EncodedAudio(packet) = payload else {
            warn!("audio decoder ignoring {kind:?} payload");
            return;
        };

        match self.state {
            PipeState::Unconfigured => {
                if self.pending.len() >= PENDING_LIMIT {
                    warn!("audio decoder pending queue full, dropping packet");
                    return;
                }
                self.pending.push_back(packet);
            }
            PipeState::Configured => self.decode_packet(Some(&packet.data)),
            PipeState::Errored | PipeState::Cleaned => {}
        }
    }

    fn cleanup(&mut self) {
        self.decoder = None;
        self.pending.clear();
        self.state = PipeState::Cleaned;
        self.base.cleanup();
    }
}

/// Ring buffer between the decode path and the cpal callback.
struct PcmRing {
    samples: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    capacity: usize,
}

impl PcmRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0f32; capacity],
            read_pos: 0,
            write_pos: 0,
            capacity,
        }
    }

    fn write(&mut self, data: &[f32]) {
        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let mut count = 0;
        for sample in out.iter_mut() {
            if self.read_pos == self.write_pos {
                *sample = 0.0; // underrun: silence
            } else {
                *sample = self.samples[self.read_pos];
                self.read_pos = (self.read_pos + 1) % self.capacity;
                count += 1;
            }
        }
        count
    }
}

enum SinkControl {
    Start(AudioConfig, mpsc::Sender<Result<(), String>>),
    Stop,
}

/// Terminal audio pipe: owns the output stream on a dedicated thread
/// (the platform stream handle cannot leave the thread that built it).
pub struct PcmSink {
    buffer: Arc<Mutex<PcmRing>>,
    control_tx: Option<mpsc::Sender<SinkControl>>,
    state: PipeState,
}

impl PcmSink {
    pub fn new() -> Self {
        // Room for ~200 ms of 48 kHz stereo.
        let buffer = Arc::new(Mutex::new(PcmRing::new(48_000 * 2 / 5)));
        Self {
            buffer,
            control_tx: None,
            state: PipeState::Unconfigured,
        }
    }

    pub fn environment_supported() -> bool {
        use cpal::traits::HostTrait;
        cpal::default_host().default_output_device().is_some()
    }

    fn spawn_stream_thread(&mut self) {
        let (control_tx, control_rx) = mpsc::channel::<SinkControl>();
        let buffer = self.buffer.clone();

        thread::spawn(move || {
            use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

            // Stream lives here until Stop arrives.
            let mut _stream = None;

            while let Ok(control) = control_rx.recv() {
                match control {
                    SinkControl::Start(audio, ack) => {
                        let result = (|| {
                            let host = cpal::default_host();
                            let device = host
                                .default_output_device()
                                .ok_or_else(|| "no audio output device".to_string())?;
                            info!(
                                "audio device: {}",
                                device.name().unwrap_or_else(|_| "unknown".into())
                            );

                            let config = cpal::StreamConfig {
                                channels: audio.channels as u16,
                                sample_rate: cpal::SampleRate(audio.sample_rate),
                                buffer_size: cpal::BufferSize::Default,
                            };

                            let ring = buffer.clone();
                            let stream = device
                                .build_output_stream(
                                    &config,
                                    move |data: &mut [f32], _| {
                                        ring.lock().read(data);
                                    },
                                    |err| error!("audio stream error: {err}"),
                                    None,
                                )
                                .map_err(|e| e.to_string())?;
                            stream.play().map_err(|e| e.to_string())?;
                            Ok::<_, String>(stream)
                        })();

                        match result {
                            Ok(stream) => {
                                _stream = Some(stream);
                                let _ = ack.send(Ok(()));
                            }
                            Err(message) => {
                                let _ = ack.send(Err(message));
                            }
                        }
                    }
                    SinkControl::Stop => break,
                }
            }
        });

        self.control_tx = Some(control_tx);
    }
}

impl Default for PcmSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for PcmSink {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        let audio = config
            .audio
            .clone()
            .ok_or(PipelineError::Unsupported("no audio configuration"))?;

        // Resize for the negotiated rate before the stream starts pulling.
        *self.buffer.lock() =
            PcmRing::new((audio.sample_rate as usize) * (audio.channels as usize) / 5);

        self.spawn_stream_thread();
        let (ack_tx, ack_rx) = mpsc::channel();
        if let Some(tx) = &self.control_tx {
            tx.send(SinkControl::Start(audio, ack_tx))
                .map_err(|_| PipelineError::Resource("audio thread gone".into()))?;
        }
        match ack_rx.recv() {
            Ok(Ok(())) => {
                self.state = PipeState::Configured;
                Ok(())
            }
            Ok(Err(message)) => {
                self.state = PipeState::Errored;
                Err(PipelineError::Configuration(message))
            }
            Err(_) => {
                self.state = PipeState::Errored;
                Err(PipelineError::Resource("audio thread died during setup".into()))
            }
        }
    }

    fn submit(&mut self, payload: PipePayload) {
        if self.state != PipeState::Configured {
            return;
        }
        let kind = payload.kind();
        let PipePayload::Pcm(block) = payload else {
            warn!("pcm sink ignoring {kind:?} payload");
            return;
        };
        self.buffer.lock().write(&block.samples);
    }

    fn cleanup(&mut self) {
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(SinkControl::Stop);
        }
        self.state = PipeState::Cleaned;
    }
}
