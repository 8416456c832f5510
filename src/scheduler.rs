//! Continuous-batch scheduler: a single-threaded, cooperative loop that
//! moves requests from a FIFO prefill queue into a shared decode batch,
//! then advances every request in the batch by one decode step per call
//! to `step`. No pre-emption — a request keeps its slot in the batch
//! until its own decode closure says it's done.

use std::collections::VecDeque;

pub struct Request {
    pub id: u64,
    pub prefill: Option<Box<dyn FnOnce() + Send>>,
    /// Returns `true` to keep the request in the batch for another step,
    /// `false` once it has finished (emitted a stop token, hit the
    /// max-token cap, or been cancelled).
    pub decode_step: Box<dyn FnMut() -> bool + Send>,
}

#[derive(Default)]
pub struct ContinuousBatchScheduler {
    prefill_queue: VecDeque<Request>,
    decode_batch: Vec<Request>,
}

impl ContinuousBatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, request: Request) {
        self.prefill_queue.push_back(request);
    }

    pub fn is_empty(&self) -> bool {
        self.prefill_queue.is_empty() && self.decode_batch.is_empty()
    }

    pub fn prefill_queue_size(&self) -> usize {
        self.prefill_queue.len()
    }

    pub fn decode_batch_size(&self) -> usize {
        self.decode_batch.len()
    }

    /// Drains the prefill queue into the decode batch (running each
    /// request's prefill closure first), then advances every request
    /// currently in the batch by one decode step, dropping any that
    /// report they're finished.
    pub fn step(&mut self) {
        while let Some(mut request) = self.prefill_queue.pop_front() {
            if let Some(prefill) = request.prefill.take() {
                prefill();
            }
            self.decode_batch.push(request);
        }

        if self.decode_batch.is_empty() {
            return;
        }

        let mut remaining = Vec::with_capacity(self.decode_batch.len());
        for mut request in self.decode_batch.drain(..) {
            if (request.decode_step)() {
                remaining.push(request);
            }
        }
        self.decode_batch = remaining;
    }

    pub fn drain(&mut self) {
        while !self.is_empty() {
            self.step();
        }
    }
}
