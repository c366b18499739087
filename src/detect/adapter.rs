//! Asynchronous inference over a loaded detector.
//!
//! `detect` hands the frame to a dedicated inference worker and returns at once.
//! The completion runs on that worker, so callers must marshal anything that
//! touches render state onto their own thread.

use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::backend::DetectorBackend;
use super::registry::ModelHandle;
use super::result::DetectionBatch;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Callback receiving the outcome of one `detect` call.
pub type Completion = Box<dyn FnOnce(Result<DetectionBatch, InferenceError>) + Send + 'static>;

struct Job {
    frame: Frame,
    done: Completion,
}

pub struct InferenceAdapter {
    model: ModelHandle,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
}

impl InferenceAdapter {
    /// Start an inference worker for `model`. Detections whose top label scores
    /// under `confidence_threshold` are dropped from each batch.
    pub fn new(model: ModelHandle, confidence_threshold: f32) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let backend = model.backend();
        let worker_pending = pending.clone();
        let worker = std::thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || worker_loop(rx, backend, confidence_threshold, worker_pending))
            .context("spawn inference worker")?;
        log::info!(
            "InferenceAdapter: {} ready ({} backend, threshold {:.2})",
            model.name(),
            model.backend_name(),
            confidence_threshold
        );
        Ok(Self {
            model,
            tx: Some(tx),
            worker: Some(worker),
            pending,
        })
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Submit a frame. Never blocks on inference; `done` runs on the worker.
    ///
    /// Overlapping submissions are accepted and processed in order.
    pub fn detect<F>(&self, frame: Frame, done: F)
    where
        F: FnOnce(Result<DetectionBatch, InferenceError>) + Send + 'static,
    {
        let done: Completion = Box::new(done);
        let Some(tx) = self.tx.as_ref() else {
            done(Err(InferenceError::WorkerGone));
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::SendError(job)) = tx.send(Job { frame, done }) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            (job.done)(Err(InferenceError::WorkerGone));
        }
    }

    /// Run one frame and wait for its batch.
    pub fn detect_blocking(&self, frame: Frame) -> Result<DetectionBatch, InferenceError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.detect(frame, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or(Err(InferenceError::WorkerGone))
    }

    /// Submissions not yet completed.
    pub fn in_flight(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for InferenceAdapter {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain queued jobs and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("InferenceAdapter: worker for {} panicked", self.model.name());
            }
        }
    }
}

fn worker_loop(
    rx: Receiver<Job>,
    backend: Arc<Mutex<Box<dyn DetectorBackend>>>,
    threshold: f32,
    pending: Arc<AtomicUsize>,
) {
    for Job { frame, done } in rx {
        let result = run_one(&backend, frame, threshold);
        pending.fetch_sub(1, Ordering::SeqCst);
        done(result);
    }
}

fn run_one(
    backend: &Mutex<Box<dyn DetectorBackend>>,
    frame: Frame,
    threshold: f32,
) -> Result<DetectionBatch, InferenceError> {
    let sequence = frame.sequence();
    let mut backend = backend
        .lock()
        .map_err(|_| InferenceError::backend(sequence, anyhow!("detector state poisoned")))?;
    let ranked = panic::catch_unwind(AssertUnwindSafe(|| backend.detect(&frame.view())))
        .map_err(|_| InferenceError::backend(sequence, anyhow!("detector panicked")))?
        .map_err(|err| InferenceError::backend(sequence, err))?;
    drop(frame);
    Ok(DetectionBatch::from_ranked(sequence, ranked, threshold))
}
