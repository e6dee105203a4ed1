use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Readout statistics, with *all-time* counters and a *sliding 1 s window* rate.
#[derive(Clone, Debug)]
pub struct Counter {
    /// All-time bytes read from the hardware buffers
    pub bytes_read: usize,
    /// All-time number of buffer pairs read
    pub buffer_counter: usize,
    /// Pixels decoded since the run started
    pub pixels: usize,
    /// Bytes of the last read divided by its wall-clock duration, in MB/s
    pub read_rate: f64,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    reads: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            bytes_read: 0,
            buffer_counter: 0,
            pixels: 0,
            read_rate: 0.0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            reads: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

const MB: f64 = 1024.0 * 1024.0;

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.bytes_read as f64 / secs) / MB
    }

    /// Sliding-window rate over the last second, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / MB
    }

    /// Record one buffer read of `size` bytes that took `elapsed`.
    pub fn record_read(&mut self, size: usize, elapsed: Duration) {
        let now = Instant::now();

        self.bytes_read += size;
        self.buffer_counter += 1;
        self.read_rate = (size as f64 / elapsed.as_secs_f64().max(1e-9)) / MB;

        self.reads.push_back((now, size));
        self.bytes_in_window += size;
        while let Some(&(ts, sz)) = self.reads.front() {
            if now.duration_since(ts) > self.window {
                self.reads.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Counter::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reads_accumulate() {
        let mut c = Counter::new();
        c.record_read(1024 * 1024, Duration::from_millis(500));
        c.record_read(1024 * 1024, Duration::from_millis(250));
        assert_eq!(c.bytes_read, 2 * 1024 * 1024);
        assert_eq!(c.buffer_counter, 2);
        assert_relative_eq!(c.read_rate, 4.0, epsilon = 1e-9);
        assert_relative_eq!(c.rate(), 2.0, epsilon = 1e-9);

        c.reset();
        assert_eq!(c.buffer_counter, 0);
        assert_eq!(c.rate(), 0.0);
    }
}
