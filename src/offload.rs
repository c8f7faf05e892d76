//! Bounded plate-recognition offload.
//!
//! The pipeline thread is the only producer. One or more worker threads pop
//! `PlateTask`s, call the recognizer, write a `PlateResult` keyed by task id and
//! acknowledge it. The result store has a single writer role (workers) and is
//! only handed to the reader by `OffloadQueue::drain`, which consumes the queue:
//! there is no way to look at results before the drain barrier returns.
//!
//! Full-queue policy: `submit` blocks for at most `submit_timeout`, then drops
//! the task and logs it. Dropped tasks are not counted as submitted and never
//! produce a result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::frame::PlateImage;
use crate::now_s;
use crate::plate::PlateRecognizer;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Clone, Debug)]
pub struct OffloadConfig {
    pub capacity: usize,
    pub workers: usize,
    pub submit_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            submit_timeout: Duration::from_millis(DEFAULT_SUBMIT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlateTask {
    pub task_id: u64,
    pub frame_id: u64,
    pub tracker_id: u64,
    pub image: PlateImage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateResult {
    pub task_id: u64,
    pub frame_id: u64,
    pub tracker_id: u64,
    /// Empty when no plate could be read.
    pub license_plate: String,
    /// Seconds since the Unix epoch.
    pub processed_at: u64,
}

impl PlateResult {
    pub fn is_resolved(&self) -> bool {
        !self.license_plate.trim().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    Dropped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OffloadStats {
    pub submitted: u64,
    pub dropped: u64,
}

/// Recognize a plate, folding errors and panics into an empty reading.
pub fn resolve_plate(recognizer: &dyn PlateRecognizer, task: &PlateTask) -> PlateResult {
    let outcome = catch_unwind(AssertUnwindSafe(|| recognizer.recognize(&task.image)));
    let license_plate = match outcome {
        Ok(Ok(text)) => text.trim().to_string(),
        Ok(Err(e)) => {
            log::warn!(
                "plate recognition failed for task {} (track {}): {}",
                task.task_id,
                task.tracker_id,
                e
            );
            String::new()
        }
        Err(_) => {
            log::error!(
                "plate recognizer {} panicked on task {}",
                recognizer.name(),
                task.task_id
            );
            String::new()
        }
    };
    PlateResult {
        task_id: task.task_id,
        frame_id: task.frame_id,
        tracker_id: task.tracker_id,
        license_plate,
        processed_at: now_s().unwrap_or(0),
    }
}

type ResultStore = Arc<Mutex<HashMap<u64, PlateResult>>>;

pub struct OffloadQueue {
    task_tx: Option<Sender<PlateTask>>,
    ack_rx: Receiver<u64>,
    results: ResultStore,
    workers: Vec<JoinHandle<()>>,
    submit_timeout: Duration,
    stats: OffloadStats,
}

impl OffloadQueue {
    /// Spawn `config.workers` consumers sharing one recognizer.
    pub fn start(config: &OffloadConfig, recognizer: Arc<dyn PlateRecognizer>) -> Result<Self> {
        if config.capacity == 0 {
            return Err(anyhow!("offload queue capacity must be at least 1"));
        }
        if config.workers == 0 {
            return Err(anyhow!("offload requires at least one worker"));
        }

        let (task_tx, task_rx) = crossbeam_channel::bounded::<PlateTask>(config.capacity);
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded::<u64>();
        let results: ResultStore = Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(config.workers);
        for worker_index in 0..config.workers {
            let task_rx = task_rx.clone();
            let ack_tx = ack_tx.clone();
            let results = results.clone();
            let recognizer = recognizer.clone();
            let poll_interval = config.poll_interval;
            let handle = thread::Builder::new()
                .name(format!("plate-worker-{}", worker_index))
                .spawn(move || {
                    run_worker(
                        worker_index,
                        task_rx,
                        ack_tx,
                        results,
                        recognizer.as_ref(),
                        poll_interval,
                    )
                })
                .map_err(|e| anyhow!("failed to spawn plate worker: {}", e))?;
            workers.push(handle);
        }
        log::info!(
            "plate offload started: {} worker(s), queue capacity {}, recognizer {}",
            config.workers,
            config.capacity,
            recognizer.name()
        );

        Ok(Self {
            task_tx: Some(task_tx),
            ack_rx,
            results,
            workers,
            submit_timeout: config.submit_timeout,
            stats: OffloadStats::default(),
        })
    }

    /// Enqueue a task, waiting at most `submit_timeout` for room.
    pub fn submit(&mut self, task: PlateTask) -> Result<SubmitOutcome> {
        let tx = self
            .task_tx
            .as_ref()
            .ok_or_else(|| anyhow!("offload queue already closed"))?;
        let task_id = task.task_id;
        match tx.send_timeout(task, self.submit_timeout) {
            Ok(()) => {
                self.stats.submitted += 1;
                Ok(SubmitOutcome::Queued)
            }
            Err(SendTimeoutError::Timeout(task)) => {
                self.stats.dropped += 1;
                log::warn!(
                    "plate queue full; dropped task {} (frame {}, track {}), dropped total {}",
                    task_id,
                    task.frame_id,
                    task.tracker_id,
                    self.stats.dropped
                );
                Ok(SubmitOutcome::Dropped)
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(anyhow!("plate workers stopped; task {} not queued", task_id))
            }
        }
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    /// Drain barrier: close the queue, wait for every submitted task to be
    /// acknowledged, join the workers and hand over the result store.
    pub fn drain(mut self) -> Result<DrainedResults> {
        self.task_tx = None;

        let expected = self.stats.submitted as usize;
        let mut acked = HashSet::with_capacity(expected);
        while acked.len() < expected {
            match self.ack_rx.recv() {
                Ok(task_id) => {
                    acked.insert(task_id);
                }
                Err(_) => {
                    return Err(anyhow!(
                        "plate workers exited with {} of {} tasks unacknowledged",
                        expected - acked.len(),
                        expected
                    ));
                }
            }
        }

        self.join_workers()?;

        let results = {
            let mut guard = self
                .results
                .lock()
                .map_err(|_| anyhow!("plate result store lock poisoned"))?;
            std::mem::take(&mut *guard)
        };
        if results.len() != expected {
            return Err(anyhow!(
                "plate result store holds {} results for {} submitted tasks",
                results.len(),
                expected
            ));
        }
        log::info!(
            "plate offload drained: {} result(s), {} dropped",
            results.len(),
            self.stats.dropped
        );
        Ok(DrainedResults {
            results: results.into_iter().collect(),
            stats: self.stats,
        })
    }

    fn join_workers(&mut self) -> Result<()> {
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} plate worker thread(s) panicked", panicked));
        }
        Ok(())
    }
}

impl Drop for OffloadQueue {
    fn drop(&mut self) {
        // Queued tasks are still processed; workers exit once the channel is empty.
        self.task_tx = None;
        if let Err(e) = self.join_workers() {
            log::error!("plate offload shutdown: {}", e);
        }
    }
}

fn run_worker(
    worker_index: usize,
    task_rx: Receiver<PlateTask>,
    ack_tx: Sender<u64>,
    results: ResultStore,
    recognizer: &dyn PlateRecognizer,
    poll_interval: Duration,
) {
    log::debug!("plate worker {} started", worker_index);
    loop {
        let task = match task_rx.recv_timeout(poll_interval) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let result = resolve_plate(recognizer, &task);
        let task_id = task.task_id;
        match results.lock() {
            Ok(mut store) => {
                if store.contains_key(&task_id) {
                    log::error!("duplicate plate result for task {}; keeping first", task_id);
                } else {
                    store.insert(task_id, result);
                }
            }
            Err(_) => {
                log::error!("plate result store lock poisoned; worker {} exiting", worker_index);
                break;
            }
        }
        if ack_tx.send(task_id).is_err() {
            break;
        }
    }
    log::debug!("plate worker {} stopped", worker_index);
}

/// Result store handed over by the drain barrier, ordered by task id.
#[derive(Debug, Default)]
pub struct DrainedResults {
    results: BTreeMap<u64, PlateResult>,
    stats: OffloadStats,
}

impl DrainedResults {
    pub fn get(&self, task_id: u64) -> Option<&PlateResult> {
        self.results.get(&task_id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn stats(&self) -> OffloadStats {
        self.stats
    }

    pub fn into_results(self) -> Vec<PlateResult> {
        self.results.into_values().collect()
    }
}
