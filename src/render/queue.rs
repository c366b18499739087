//! Marshalling onto the render-owning thread.
//!
//! `RenderQueue` is the only handle other threads get: it posts closures that
//! run against the renderer on whichever thread pumps the `RenderLoop`.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::OverlayRenderer;

type RenderJob = Box<dyn FnOnce(&mut OverlayRenderer) + Send + 'static>;

#[derive(Clone)]
pub struct RenderQueue {
    tx: Sender<RenderJob>,
}

impl RenderQueue {
    /// Post a job to the render thread. Returns false once the loop is gone.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut OverlayRenderer) + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }
}

pub struct RenderLoop {
    renderer: OverlayRenderer,
    rx: Receiver<RenderJob>,
}

/// Pair a renderer with the queue that feeds it.
pub fn render_channel(renderer: OverlayRenderer) -> (RenderQueue, RenderLoop) {
    let (tx, rx) = mpsc::channel();
    (RenderQueue { tx }, RenderLoop { renderer, rx })
}

impl RenderLoop {
    pub fn renderer(&self) -> &OverlayRenderer {
        &self.renderer
    }

    /// Run every job already queued. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(job) => {
                    job(&mut self.renderer);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Wait up to `timeout` for one job and run it.
    pub fn run_next(&mut self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                job(&mut self.renderer);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Run jobs until every `RenderQueue` is dropped, then hand the renderer back.
    pub fn run(mut self) -> OverlayRenderer {
        while let Ok(job) = self.rx.recv() {
            job(&mut self.renderer);
        }
        self.renderer
    }

    /// Move the loop onto a dedicated render thread.
    pub fn spawn(self) -> Result<JoinHandle<OverlayRenderer>> {
        std::thread::Builder::new()
            .name("render".to_string())
            .spawn(move || self.run())
            .context("spawn render thread")
    }
}
