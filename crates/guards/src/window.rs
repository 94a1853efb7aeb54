//! Fixed-size rolling window of pass/fail history
//!
//! A [`RollingWindow`] is a circular bit buffer over the most recent
//! `size` results of a protected call site. Once full, every
//! [`record`](RollingWindow::record) overwrites the oldest slot; the failure
//! count tracks the window contents incrementally so threshold evaluation is
//! O(1).
//!
//! # Complexity
//! - `record`, `is_over_threshold`, and the count accessors are all **O(1)**;
//!   `clear` is O(size/64).
//!
//! # Thread Safety
//! - No internal synchronization. The circuit breaker owns its window inside
//!   its single lock domain and serializes all access.

/// Circular bit buffer tracking pass/fail history for the circuit breaker.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    size: usize,
    threshold: usize,
    blocks: Vec<u64>,
    write_index: usize,
    failure_count: usize,
    filled_count: usize,
}

impl RollingWindow {
    /// Creates a window holding `size` results with a failure threshold of
    /// `ceil(size * failure_ratio)`.
    ///
    /// A size of zero is clamped to `1`; ratio bounds are validated by the
    /// breaker policy before construction.
    pub fn new(size: usize, failure_ratio: f64) -> Self {
        let size = size.max(1);
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let threshold = (size as f64 * failure_ratio).ceil() as usize;
        Self {
            size,
            threshold,
            blocks: vec![0; size.div_ceil(64)],
            write_index: 0,
            failure_count: 0,
            filled_count: 0,
        }
    }

    /// Records one result, overwriting the oldest slot once the window is
    /// full.
    pub fn record(&mut self, is_failure: bool) {
        if self.filled_count == self.size {
            if self.bit(self.write_index) {
                self.failure_count -= 1;
            }
        } else {
            self.filled_count += 1;
        }

        self.set_bit(self.write_index, is_failure);
        if is_failure {
            self.failure_count += 1;
        }

        self.write_index = (self.write_index + 1) % self.size;
    }

    /// Whether the window is full **and** the failures in it have reached the
    /// threshold.
    ///
    /// Never true while the window is still filling, regardless of how many
    /// failures it holds.
    pub fn is_over_threshold(&self) -> bool {
        self.filled_count == self.size && self.failure_count >= self.threshold
    }

    /// Resets all counters and bits.
    pub fn clear(&mut self) {
        self.blocks.fill(0);
        self.write_index = 0;
        self.failure_count = 0;
        self.filled_count = 0;
    }

    /// Number of failures among the currently stored results.
    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    /// Number of results currently stored, saturating at the window size.
    pub fn filled_count(&self) -> usize {
        self.filled_count
    }

    /// The configured window size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The failure threshold, `ceil(size * failure_ratio)`.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn bit(&self, index: usize) -> bool {
        self.blocks[index / 64] >> (index % 64) & 1 == 1
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        let mask = 1u64 << (index % 64);
        if value {
            self.blocks[index / 64] |= mask;
        } else {
            self.blocks[index / 64] &= !mask;
        }
    }
}
