//! Bounded statistical sample buffers.
//!
//! Path quality is judged from short rolling windows of observations
//! (latency, packet validity, QoS record sizes). The buffers here enforce
//! their capacity before insertion so that hot-path bookkeeping can never
//! grow without bound.

use std::collections::VecDeque;

/// Fixed-capacity ring of samples with summary statistics.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SampleBuffer {
    /// Create an empty buffer holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one if the buffer is full.
    pub fn push(&mut self, sample: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Arithmetic mean of the buffered samples, `0.0` when empty.
    pub fn mean(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    /// Population variance of the buffered samples, `0.0` when empty.
    pub fn variance(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        self.samples
            .iter()
            .map(|s| {
                let d = s - mean;
                d * d
            })
            .sum::<f32>()
            / self.samples.len() as f32
    }

    pub fn stddev(&self) -> f32 {
        self.variance().sqrt()
    }
}

/// Exponentially-weighted moving average for ratio-style observations
/// (e.g. per-window packet loss).
#[derive(Debug, Clone, Copy)]
pub struct Ewma {
    value: f32,
    alpha: f32,
}

impl Ewma {
    pub fn new(alpha: f32) -> Self {
        Self { value: 0.0, alpha }
    }

    pub fn update(&mut self, observation: f32) {
        self.value = (self.alpha * observation) + ((1.0 - self.alpha) * self.value);
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}
