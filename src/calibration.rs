use crate::CalibrationSettings;

const MAX_OFFSET: f64 = 0xFFFF as f64;
/// Proportional steps taken before switching to interpolation.
const PROPORTIONAL_ITERATIONS: usize = 2;

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum SearchState {
    Searching,
    Converged,
    /// Iteration cap reached before the tolerance was met.
    GaveUp,
    /// The channel's offset DAC never settled.
    Unstable,
}

/// DC-offset search for one channel.
///
/// Each measured baseline moves the trial offset: by a proportional step for
/// the first iterations, then by interpolating through the two most recent
/// (offset, baseline) pairs.
#[derive(Clone, Debug)]
pub struct OffsetSearch {
    target: f64,
    tolerance: f64,
    gain: f64,
    max_iterations: u32,
    offset: u32,
    history: Vec<(f64, f64)>,
    best: Option<(u32, f64)>,
    state: SearchState,
}

impl OffsetSearch {
    pub fn new(start_offset: u32, settings: &CalibrationSettings) -> Self {
        Self {
            target: settings.target_baseline,
            tolerance: settings.tolerance,
            gain: settings.proportional_gain,
            max_iterations: settings.max_iterations.max(1),
            offset: start_offset.min(MAX_OFFSET as u32),
            history: Vec::new(),
            best: None,
            state: SearchState::Searching,
        }
    }

    /// The offset to program for the next measurement.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SearchState::Searching
    }

    pub fn iterations(&self) -> usize {
        self.history.len()
    }

    /// Best (offset, baseline) measured so far.
    pub fn best(&self) -> Option<(u32, f64)> {
        self.best
    }

    /// Feed the baseline measured at the current offset.
    pub fn record(&mut self, baseline: f64) -> SearchState {
        if !self.is_active() {
            return self.state;
        }
        let offset = self.offset;
        self.history.push((offset as f64, baseline));
        let gap = (baseline - self.target).abs();
        let improved = match self.best {
            Some((_, b)) => gap < (b - self.target).abs(),
            None => true,
        };
        if improved {
            self.best = Some((offset, baseline));
        }

        if gap <= self.tolerance {
            self.state = SearchState::Converged;
        } else if self.history.len() >= self.max_iterations as usize {
            self.state = SearchState::GaveUp;
        } else {
            self.offset = self.next_offset();
        }
        self.state
    }

    pub fn mark_unstable(&mut self) {
        if self.is_active() {
            self.state = SearchState::Unstable;
        }
    }

    fn next_offset(&self) -> u32 {
        let n = self.history.len();
        let (o1, b1) = self.history[n - 1];
        let proportional = o1 + self.gain * (self.target - b1);
        let next = if n <= PROPORTIONAL_ITERATIONS {
            proportional
        } else {
            let (o0, b0) = self.history[n - 2];
            let slope = (b1 - b0) / (o1 - o0);
            if slope.is_finite() && slope.abs() > f64::EPSILON {
                o1 + (self.target - b1) / slope
            } else {
                proportional
            }
        };
        next.round().clamp(0.0, MAX_OFFSET) as u32
    }
}

/// Outcome of calibrating one channel.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ChannelCalibration {
    pub board: usize,
    pub channel: usize,
    pub offset: u32,
    pub baseline: Option<f64>,
    pub iterations: usize,
    pub state: SearchState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CalibrationSettings {
        CalibrationSettings {
            target_baseline: 100.0,
            tolerance: 2.0,
            max_iterations: 20,
            proportional_gain: 16.0,
            record_length: 64,
        }
    }

    fn run(search: &mut OffsetSearch, response: impl Fn(u32) -> f64) {
        while search.is_active() {
            let baseline = response(search.offset());
            search.record(baseline);
        }
    }

    #[test]
    fn converges_on_a_linear_response() {
        let mut search = OffsetSearch::new(0x8000, &settings());
        run(&mut search, |offset| 20.0 + offset as f64 / 20.0);
        assert_eq!(search.state(), SearchState::Converged);
        let (offset, baseline) = search.best().unwrap();
        assert!((baseline - 100.0).abs() <= 2.0);
        assert!((offset as i64 - 1600).abs() <= 40);
        assert!(search.iterations() <= 5);
    }

    #[test]
    fn first_steps_are_proportional() {
        let mut search = OffsetSearch::new(10_000, &settings());
        search.record(150.0);
        assert_eq!(search.offset(), 10_000 - 800);
        search.record(130.0);
        assert_eq!(search.offset(), 9_200 - 480);
        // from here on the step interpolates the two latest measurements
        search.record(118.0);
        let slope: f64 = (118.0 - 130.0) / (8720.0 - 9200.0);
        let expected = (8720.0 + (100.0 - 118.0) / slope).round() as u32;
        assert_eq!(search.offset(), expected);
    }

    #[test]
    fn gives_up_with_best_offset_after_the_cap() {
        let mut limited = settings();
        limited.max_iterations = 4;
        let mut search = OffsetSearch::new(0x8000, &limited);
        // the baseline cannot go below 300 no matter the offset
        run(&mut search, |offset| (offset as f64 / 20.0).max(300.0));
        assert_eq!(search.state(), SearchState::GaveUp);
        assert_eq!(search.iterations(), 4);
        let (_, baseline) = search.best().unwrap();
        assert_eq!(baseline, 300.0);
    }

    #[test]
    fn flat_response_falls_back_to_proportional_and_clamps() {
        let mut search = OffsetSearch::new(100, &settings());
        search.record(500.0);
        assert_eq!(search.offset(), 0);
        search.record(500.0);
        search.record(500.0);
        assert_eq!(search.offset(), 0);
        search.mark_unstable();
        assert_eq!(search.state(), SearchState::Unstable);
    }
}
