//! A pipeline stage: input queue, bounded workers, success and failure queues.
//!
//! Work runs on spawned tokio tasks; completions come back over a channel that
//! the coordinator drains with `try_recv`, so a sweep never blocks on a stage.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::debug;
use tokio::sync::mpsc;

use crate::{Error, Result};

type Handler<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

pub struct StageService<I, O> {
    name: &'static str,
    limit: usize,
    in_flight: usize,
    holds_slots: bool,
    queue: VecDeque<(String, I)>,
    handler: Handler<I, O>,
    done_tx: mpsc::UnboundedSender<(String, Result<O>)>,
    done_rx: mpsc::UnboundedReceiver<(String, Result<O>)>,
}

impl<I, O> StageService<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F>(name: &'static str, limit: usize, handler: F) -> Self
    where
        F: Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync + 'static,
    {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            name,
            limit: limit.max(1),
            in_flight: 0,
            holds_slots: false,
            queue: VecDeque::new(),
            handler: Arc::new(handler),
            done_tx,
            done_rx,
        }
    }

    /// Keep a slot occupied after the work completes, until
    /// [`release_slot`](Self::release_slot) is called.
    pub fn holding_slots(mut self) -> Self {
        self.holds_slots = true;
        self
    }

    pub fn add_input(&mut self, key: impl Into<String>, input: I) {
        self.queue.push_back((key.into(), input));
    }

    /// Start queued work up to the concurrency cap.
    pub fn run(&mut self) {
        while self.in_flight < self.limit {
            let Some((key, input)) = self.queue.pop_front() else {
                break;
            };
            self.in_flight += 1;
            debug!("{}: starting {} ({} in flight)", self.name, key, self.in_flight);
            let work = (self.handler)(input);
            let done = self.done_tx.clone();
            tokio::spawn(async move {
                let outcome = work.await;
                let _ = done.send((key, outcome));
            });
        }
    }

    /// Split everything that finished since the last call into successes and
    /// failures.
    pub fn drain(&mut self) -> (Vec<(String, O)>, Vec<(String, Error)>) {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        while let Ok((key, outcome)) = self.done_rx.try_recv() {
            if !self.holds_slots {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            match outcome {
                Ok(output) => succeeded.push((key, output)),
                Err(err) => failed.push((key, err)),
            }
        }
        (succeeded, failed)
    }

    pub fn release_slot(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
