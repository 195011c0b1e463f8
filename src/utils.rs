use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const MB: f64 = 1024.0 * 1024.0;

/// Event and byte totals since the start of a run, plus rates over a
/// sliding window (1 s by default).
#[derive(Clone, Debug)]
pub struct RateCounter {
    /// All-time total bytes
    pub total_bytes: u64,
    /// All-time number of events
    pub n_events: u64,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    window: Duration,
    recent: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            total_bytes: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window: window.max(Duration::from_millis(1)),
            recent: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    /// Record an event of `size` bytes.
    pub fn record(&mut self, size: u64) {
        self.record_at(Instant::now(), size);
    }

    pub fn record_at(&mut self, now: Instant, size: u64) {
        self.total_bytes += size;
        self.n_events += 1;
        self.recent.push_back((now, size));
        self.bytes_in_window += size;
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, size)) = self.recent.front() {
            if now.duration_since(ts) > self.window {
                self.recent.pop_front();
                self.bytes_in_window -= size;
            } else {
                break;
            }
        }
    }

    /// Average rate since `t_begin`, in MB/s.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_bytes as f64 / secs / MB
    }

    /// Rate over the sliding window, in MB/s.
    pub fn rate(&self) -> f64 {
        self.bytes_in_window as f64 / self.window.as_secs_f64() / MB
    }

    /// Events per second over the sliding window.
    pub fn event_rate(&self) -> f64 {
        self.recent.len() as f64 / self.window.as_secs_f64()
    }

    pub fn reset(&mut self) {
        *self = Self::with_window(self.window);
    }
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= 1 << 30 => format!("{:.2} GiB", b as f64 / (1u64 << 30) as f64),
        b if b >= 1 << 20 => format!("{:.2} MiB", b as f64 / MB),
        b if b >= 1 << 10 => format!("{:.1} KiB", b as f64 / 1024.0),
        b => format!("{} B", b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_old_entries() {
        let mut counter = RateCounter::with_window(Duration::from_secs(1));
        let start = Instant::now();
        counter.record_at(start, 1024 * 1024);
        counter.record_at(start + Duration::from_millis(500), 1024 * 1024);
        assert_eq!(counter.rate(), 2.0);
        assert_eq!(counter.event_rate(), 2.0);

        counter.record_at(start + Duration::from_millis(1600), 1024 * 1024);
        assert_eq!(counter.rate(), 1.0);
        assert_eq!(counter.n_events, 3);
        assert_eq!(counter.total_bytes, 3 * 1024 * 1024);

        counter.reset();
        assert_eq!(counter.n_events, 0);
        assert_eq!(counter.rate(), 0.0);
    }

    #[test]
    fn bytes_are_formatted_by_magnitude() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}
