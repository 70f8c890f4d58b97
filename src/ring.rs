//! Bounded FIFO of photometer samples with frequency statistics. Each ring
//! has exactly one producer and one consumer; append on a full ring evicts
//! the oldest sample.

use std::collections::VecDeque;

use crate::stats;
use crate::{CentralTendency, Error, Result, Sample};

#[derive(Debug, Clone)]
pub struct RingBuffer {
    buffer: VecDeque<Sample>,
    capacity: usize,
    central: CentralTendency,
}

impl RingBuffer {
    pub fn new(capacity: usize, central: CentralTendency) -> Self {
        RingBuffer {
            buffer: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            central,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn central(&self) -> CentralTendency {
        self.central
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn append(&mut self, sample: Sample) {
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(sample);
    }

    pub fn pop_front(&mut self) -> Option<Sample> {
        self.buffer.pop_front()
    }

    pub fn front(&self) -> Option<&Sample> {
        self.buffer.front()
    }

    pub fn back(&self) -> Option<&Sample> {
        self.buffer.back()
    }

    /// Current frequency sequence, oldest first.
    pub fn frequencies(&self) -> Vec<f64> {
        self.buffer.iter().map(|s| s.freq).collect()
    }

    /// Owned copy of the current contents. Must be taken in the same
    /// critical section as the statistics that describe it, since a producer
    /// keeps overwriting the ring during calibration rounds.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.buffer.iter().cloned().collect()
    }

    /// Central estimate and sample standard deviation over the frequencies.
    /// Needs at least two samples; `Mode` additionally needs a unique mode.
    pub fn statistics(&self) -> Result<(f64, f64)> {
        let freqs = self.frequencies();
        if freqs.len() < 2 {
            return Err(Error::Statistics(format!(
                "need at least 2 samples, have {}",
                freqs.len()
            )));
        }
        let central = stats::central(&freqs, self.central)?;
        let stdev = stats::sample_stdev(&freqs).ok_or_else(|| {
            Error::Statistics("standard deviation needs 2 samples".to_string())
        })?;
        Ok((central, stdev))
    }
}
