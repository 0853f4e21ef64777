//! Threaded, order-preserving example loader.
//!
//! A dispatcher thread walks shuffled epochs forever and hands `(sequence,
//! index)` jobs to a pool of workers, which read and transform the example.
//! Both hand-offs go through bounded channels, so workers stall once
//! `prefetch` results are waiting. The consumer receives examples in sequence
//! order regardless of which worker finished first.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::common::{DetectorError, DetectorResult};
use crate::training::dataset::{DetectionDataset, TrainExample};
use crate::training::transform::Transform;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub n_workers: usize,
    /// Capacity of the job and result channels.
    pub prefetch: usize,
    pub seed: u64,
    pub shuffle: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let n_workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            n_workers,
            prefetch: n_workers * 2,
            seed: 0,
            shuffle: true,
        }
    }
}

impl LoaderConfig {
    pub fn with_workers(mut self, n: usize) -> Self {
        self.n_workers = n;
        self
    }

    pub fn with_prefetch(mut self, n: usize) -> Self {
        self.prefetch = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }
}

type Job = (u64, usize);
type Produced = (u64, DetectorResult<TrainExample>);

/// Randomness for one example depends only on the run seed and its position.
fn example_rng(seed: u64, sequence: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ sequence.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn dispatch(jobs: Sender<Job>, len: usize, seed: u64, shuffle: bool) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut order: Vec<usize> = (0..len).collect();
    let mut sequence = 0u64;
    loop {
        if shuffle {
            order.shuffle(&mut rng);
        }
        for &index in order.iter() {
            if jobs.send((sequence, index)).is_err() {
                return;
            }
            sequence += 1;
        }
    }
}

fn work(
    jobs: Receiver<Job>,
    results: Sender<Produced>,
    dataset: Arc<dyn DetectionDataset>,
    transform: Transform,
    seed: u64,
) {
    for (sequence, index) in jobs.iter() {
        let produced = catch_unwind(AssertUnwindSafe(|| {
            let example = dataset.get_example(index)?;
            transform.apply(example, &mut example_rng(seed, sequence))
        }))
        .unwrap_or_else(|_| Err(DetectorError::Worker(format!("worker panicked on example {index}"))))
        .map_err(|e| match e {
            DetectorError::Worker(_) => e,
            other => DetectorError::Worker(format!("example {index}: {other}")),
        });
        if results.send((sequence, produced)).is_err() {
            return;
        }
    }
}

pub struct MultiWorkerLoader {
    results: Option<Receiver<Produced>>,
    pending: BTreeMap<u64, DetectorResult<TrainExample>>,
    next: u64,
    len: usize,
    handles: Vec<JoinHandle<()>>,
}

impl MultiWorkerLoader {
    pub fn new(
        dataset: Arc<dyn DetectionDataset>,
        transform: Transform,
        config: LoaderConfig,
    ) -> DetectorResult<Self> {
        let len = dataset.len();
        if len == 0 {
            return Err(DetectorError::configuration("training dataset is empty"));
        }
        if config.n_workers == 0 || config.prefetch == 0 {
            return Err(DetectorError::configuration("loader needs at least one worker and one slot"));
        }

        let (job_tx, job_rx) = bounded::<Job>(config.prefetch);
        let (result_tx, result_rx) = bounded::<Produced>(config.prefetch);
        let mut handles = Vec::with_capacity(config.n_workers + 1);
        let (seed, shuffle) = (config.seed, config.shuffle);
        handles.push(thread::spawn(move || dispatch(job_tx, len, seed, shuffle)));
        for _ in 0..config.n_workers {
            let (jobs, results) = (job_rx.clone(), result_tx.clone());
            let (dataset, transform) = (dataset.clone(), transform.clone());
            handles.push(thread::spawn(move || work(jobs, results, dataset, transform, seed)));
        }
        log::info!("Started data loader with {} workers over {len} examples", config.n_workers);

        Ok(Self {
            results: Some(result_rx),
            pending: BTreeMap::new(),
            next: 0,
            len,
            handles,
        })
    }

    /// Size of one epoch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocks until the next example in sequence order is ready.
    pub fn next_example(&mut self) -> DetectorResult<TrainExample> {
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| DetectorError::Worker("loader is shut down".to_string()))?;
        loop {
            if let Some(produced) = self.pending.remove(&self.next) {
                self.next += 1;
                return produced;
            }
            let (sequence, produced) = results
                .recv()
                .map_err(|_| DetectorError::Worker("all workers exited".to_string()))?;
            self.pending.insert(sequence, produced);
        }
    }
}

impl Iterator for MultiWorkerLoader {
    type Item = DetectorResult<TrainExample>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_example())
    }
}

impl Drop for MultiWorkerLoader {
    fn drop(&mut self) {
        // closing the result channel makes workers and then the dispatcher exit
        self.results.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
