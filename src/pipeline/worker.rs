//! Worker-Offloaded Pipe Segments
//!
//! Moves a contiguous sub-chain onto a background thread. The boundary is a
//! single ordered channel of typed messages, so submission order survives
//! the hop; resources inside payloads move with them. No backpressure is
//! applied — the receiving side must keep up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use log::warn;

use super::{Pipe, PipePayload, PipeState};
use crate::error::PipelineError;
use crate::media::StreamConfig;

enum WorkerMessage {
    Setup(StreamConfig, mpsc::Sender<Result<(), String>>),
    Submit(PipePayload),
    Cleanup,
}

/// Runs the wrapped chain on its own thread.
pub struct WorkerPipe {
    tx: mpsc::Sender<WorkerMessage>,
    state: PipeState,
    /// Set by the worker when the inner chain wants an IDR.
    request_idr: Arc<AtomicBool>,
}

impl WorkerPipe {
    pub fn new(inner: Box<dyn Pipe>) -> Self {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let request_idr = Arc::new(AtomicBool::new(false));
        let flag = request_idr.clone();

        thread::spawn(move || {
            let mut inner = inner;
            while let Ok(message) = rx.recv() {
                match message {
                    WorkerMessage::Setup(config, ack) => {
                        let result = inner.setup(&config).map_err(|e| e.to_string());
                        let _ = ack.send(result);
                    }
                    WorkerMessage::Submit(payload) => {
                        inner.submit(payload);
                        if inner.poll_request_idr() {
                            flag.store(true, Ordering::Release);
                        }
                    }
                    WorkerMessage::Cleanup => {
                        inner.cleanup();
                        break;
                    }
                }
            }
        });

        Self {
            tx,
            state: PipeState::Unconfigured,
            request_idr,
        }
    }
}

impl Pipe for WorkerPipe {
    fn setup(&mut self, config: &StreamConfig) -> Result<(), PipelineError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.tx
            .send(WorkerMessage::Setup(config.clone(), ack_tx))
            .map_err(|_| PipelineError::Resource("worker thread gone".into()))?;

        // Setup is the one place a pipe may wait.
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
                Err(PipelineError::Resource("worker thread died during setup".into()))
            }
        }
    }

    fn submit(&mut self, payload: PipePayload) {
        if self.state == PipeState::Cleaned || self.state == PipeState::Errored {
            return;
        }
        if self.tx.send(WorkerMessage::Submit(payload)).is_err() {
            warn!("worker thread gone, pipe errored");
            self.state = PipeState::Errored;
        }
    }

    fn poll_request_idr(&mut self) -> bool {
        self.request_idr.swap(false, Ordering::AcqRel)
    }

    fn cleanup(&mut self) {
        let _ = self.tx.send(WorkerMessage::Cleanup);
        self.state = PipeState::Cleaned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DecodedFrame, VideoFormat, Yuv420VideoFrame};
    use crate::pipeline::test_support::RecordingSink;
    use std::time::Duration;

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("worker did not converge");
    }

    #[test]
    fn test_messages_cross_the_boundary_in_order() {
        let sink = RecordingSink::new();
        let frames = sink.frames.clone();
        let setups = sink.setups.clone();
        let dims = sink.last_dimensions.clone();

        let mut worker = WorkerPipe::new(Box::new(sink));
        worker
            .setup(&StreamConfig::new(VideoFormat::H264, 1280, 720, 60))
            .unwrap();
        assert_eq!(setups.load(Ordering::SeqCst), 1);

        for size in [16u32, 32, 64] {
            worker.submit(PipePayload::DecodedFrame(DecodedFrame::new(
                Yuv420VideoFrame::blank(size, size),
            )));
        }
        wait_for(|| frames.load(Ordering::SeqCst) == 3);
        // Last message wins: ordering is preserved across the channel.
        assert_eq!(*dims.lock(), Some((64, 64)));
    }

    #[test]
    fn test_idr_request_travels_back() {
        let sink = RecordingSink::new();
        let flag = sink.request_idr.clone();
        let frames = sink.frames.clone();

        let mut worker = WorkerPipe::new(Box::new(sink));
        worker
            .setup(&StreamConfig::new(VideoFormat::H264, 1280, 720, 60))
            .unwrap();

        flag.store(true, Ordering::SeqCst);
        worker.submit(PipePayload::DecodedFrame(DecodedFrame::new(
            Yuv420VideoFrame::blank(8, 8),
        )));
        wait_for(|| frames.load(Ordering::SeqCst) == 1);
        wait_for(|| worker.poll_request_idr());
    }

    #[test]
    fn test_cleanup_reaches_inner_chain() {
        let sink = RecordingSink::new();
        let cleanups = sink.cleanups.clone();

        let mut worker = WorkerPipe::new(Box::new(sink));
        worker
            .setup(&StreamConfig::new(VideoFormat::H264, 1280, 720, 60))
            .unwrap();
        worker.cleanup();
        wait_for(|| cleanups.load(Ordering::SeqCst) == 1);

        // Post-cleanup submissions are dropped silently.
        worker.submit(PipePayload::DecodedFrame(DecodedFrame::new(
            Yuv420VideoFrame::blank(8, 8),
        )));
    }
}
