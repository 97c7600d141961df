use serde::{Deserialize, Serialize};

/// Basic typed time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Samples
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }

    /// Attach uniform timestamps (starting at zero) to every sample.
    pub fn to_frame_samples(&self) -> Vec<FrameSample> {
        let dt = 1.0 / self.fs.max(f64::EPSILON);
        self.data
            .iter()
            .enumerate()
            .map(|(i, &intensity)| FrameSample {
                timestamp: i as f64 * dt,
                intensity,
            })
            .collect()
    }
}

/// What the capture collaborator hands over for a single camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FramePayload {
    /// Interleaved 8-bit RGB pixels, row major.
    Rgb8 {
        width: usize,
        height: usize,
        pixels: Vec<u8>,
    },
    /// The capture side already reduced the frame to one intensity value.
    Intensity(f64),
}

/// One raw camera frame, timestamped in seconds on the capture clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub timestamp: f64,
    pub payload: FramePayload,
}

impl RawFrame {
    pub fn intensity(timestamp: f64, value: f64) -> Self {
        Self {
            timestamp,
            payload: FramePayload::Intensity(value),
        }
    }

    pub fn rgb(timestamp: f64, width: usize, height: usize, pixels: Vec<u8>) -> Self {
        Self {
            timestamp,
            payload: FramePayload::Rgb8 {
                width,
                height,
                pixels,
            },
        }
    }
}

impl From<FrameSample> for RawFrame {
    fn from(sample: FrameSample) -> Self {
        RawFrame::intensity(sample.timestamp, sample.intensity)
    }
}

/// One scalar intensity per camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSample {
    pub timestamp: f64,
    pub intensity: f64,
}

/// Output of the conditioner for one input sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionedSample {
    pub timestamp: f64,
    /// Detrended, band-limited value.
    pub value: f64,
    /// Short-term noise floor estimate (same units as `value`).
    pub noise_floor: f64,
    /// RMS amplitude of the conditioned window divided by the noise floor.
    pub amplitude_ratio: f64,
    /// False until the conditioning buffer has filled once.
    pub trusted: bool,
}

/// A detected heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakEvent {
    pub timestamp: f64,
    pub prominence: f64,
}

/// Fixed-capacity circular storage; pushing into a full buffer evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<T>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![T::default(); capacity],
            capacity,
            head: 0,
            len: 0,
        }
    }

    /// Append `value`, returning the evicted oldest entry when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let tail = (self.head + self.len) % self.capacity;
        if self.len == self.capacity {
            let evicted = self.slots[self.head];
            self.slots[self.head] = value;
            self.head = (self.head + 1) % self.capacity;
            Some(evicted)
        } else {
            self.slots[tail] = value;
            self.len += 1;
            None
        }
    }

    /// Remove and return the oldest entry.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head];
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        Some(value)
    }

    /// Entry `index` counted from the oldest.
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        Some(self.slots[(self.head + index) % self.capacity])
    }

    pub fn last(&self) -> Option<T> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.slots[(self.head + i) % self.capacity])
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Median of a slice; `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Population mean and standard deviation; `None` when empty.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_once_full() {
        let mut ring = RingBuffer::with_capacity(3);
        assert_eq!(ring.push(1.0), None);
        assert_eq!(ring.push(2.0), None);
        assert_eq!(ring.push(3.0), None);
        assert!(ring.is_full());
        assert_eq!(ring.push(4.0), Some(1.0));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(ring.last(), Some(4.0));
        assert_eq!(ring.pop_front(), Some(2.0));
        assert_eq!(ring.to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn ring_buffer_length_is_constant_after_warmup() {
        let mut ring = RingBuffer::with_capacity(16);
        for i in 0..1000 {
            ring.push(i as f64);
            if i >= 15 {
                assert_eq!(ring.len(), 16);
            }
        }
        assert_eq!(ring.get(0), Some(984.0));
    }

    #[test]
    fn median_handles_even_and_odd() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }

    #[test]
    fn time_series_frames_are_uniform() {
        let ts = TimeSeries {
            fs: 10.0,
            data: vec![1.0, 2.0, 3.0],
        };
        let frames = ts.to_frame_samples();
        assert_eq!(frames.len(), 3);
        assert!((frames[2].timestamp - 0.2).abs() < 1e-12);
    }
}
