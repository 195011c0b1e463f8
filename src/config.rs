use confique::Config;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Config, Serialize, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run: RunSettings,
    #[config(nested)]
    pub readout: ReadoutSettings,
    #[config(nested)]
    pub calibration: CalibrationSettings,
    #[config(nested)]
    pub simulation: SimulationSettings,
    pub boards: Vec<BoardSettings>,
}

impl Conf {
    pub fn load(path: &Path) -> Result<Self, confique::Error> {
        Conf::builder().file(path).load()
    }

    /// Plain-text rendering written next to the data files.
    pub fn snapshot(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 0)]
    pub run_id: u32,
    #[config(default = "data")]
    pub output_dir: String,
    #[config(default = "run")]
    pub base_name: String,
    /// Bytes per file before rolling over to the next index.
    #[config(default = 1073741824)]
    pub max_file_size: u64,
    /// Events per file before rolling over; 0 means no limit.
    #[config(default = 0)]
    pub max_events_per_file: u32,
    #[config(default = 10)]
    pub queue_capacity: usize,
    #[config(default = 6)]
    pub compression_level: u32,
    #[config(default = true)]
    pub write_config_snapshot: bool,
    /// Seconds; 0 runs until the operator quits.
    #[config(default = 0)]
    pub run_duration: u64,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct ReadoutSettings {
    #[config(default = true)]
    pub use_interrupts: bool,
    #[config(default = 100)]
    pub interrupt_timeout_ms: u32,
    /// Issue a software trigger whenever a wait for data times out.
    #[config(default = false)]
    pub auto_trigger: bool,
    #[config(default = 8)]
    pub size_tolerance_bytes: usize,
    #[config(default = 100)]
    pub ready_retries: u32,
    #[config(default = 100)]
    pub stable_retries: u32,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct CalibrationSettings {
    #[config(default = 100.0)]
    pub target_baseline: f64,
    #[config(default = 2.0)]
    pub tolerance: f64,
    #[config(default = 20)]
    pub max_iterations: u32,
    /// Offset DAC units applied per ADC count of baseline error on the
    /// first iterations.
    #[config(default = 16.0)]
    pub proportional_gain: f64,
    /// Samples recorded per calibration trigger.
    #[config(default = 64)]
    pub record_length: u32,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct SimulationSettings {
    /// Board model code answered by every simulated board.
    #[config(default = 3)]
    pub variant_code: u32,
    /// Milliseconds between free-running simulated triggers; 0 disables them.
    #[config(default = 10)]
    pub trigger_interval_ms: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BoardSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub channel_mask: u8,
    /// Samples per channel per trigger.
    pub record_length: u32,
    /// Percent of the window recorded after the trigger.
    #[serde(default = "default_post_trigger")]
    pub post_trigger: u32,
    #[serde(default = "default_thresholds")]
    pub thresholds: ChannelValues<u32>,
    #[serde(default)]
    pub zle: bool,
    #[serde(default)]
    pub zs_threshold: u32,
    #[serde(default)]
    pub zs_samples: u32,
    /// Channels allowed to self-trigger.
    #[serde(default)]
    pub trigger_source_mask: u8,
    /// Additional channels required in coincidence for a self-trigger.
    #[serde(default)]
    pub coincidence_level: u8,
    #[serde(default)]
    pub external_trigger: bool,
    #[serde(default = "default_dc_offsets")]
    pub dc_offsets: ChannelValues<u32>,
    /// Channels whose DC offset is tuned before the run.
    #[serde(default)]
    pub calibrate_mask: u8,
    #[serde(default = "default_downsample")]
    pub downsample: ChannelValues<u32>,
}

impl BoardSettings {
    pub fn channel_enabled(&self, ch: usize) -> bool {
        self.channel_mask & (1 << ch) != 0
    }

    pub fn downsample_factors(&self) -> Vec<u32> {
        (0..crate::registers::MAX_CHANNELS)
            .map(|ch| self.downsample.get(ch, 1).max(1))
            .collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum ChannelValues<T> {
    Global(T),
    PerChannel(Vec<T>),
}

impl<T: Copy> ChannelValues<T> {
    /// Value for `ch`, or `fallback` when a per-channel list is too short.
    pub fn get(&self, ch: usize, fallback: T) -> T {
        match self {
            Self::Global(value) => *value,
            Self::PerChannel(values) => values.get(ch).copied().unwrap_or(fallback),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_post_trigger() -> u32 {
    50
}

fn default_thresholds() -> ChannelValues<u32> {
    ChannelValues::Global(0)
}

fn default_dc_offsets() -> ChannelValues<u32> {
    ChannelValues::Global(0x8000)
}

fn default_downsample() -> ChannelValues<u32> {
    ChannelValues::Global(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
[run]
run_id = 12
output_dir = "/tmp/out"
max_events_per_file = 500

[readout]
use_interrupts = false

[calibration]
target_baseline = 3800.0

[simulation]

[[boards]]
channel_mask = 3
record_length = 256
downsample = [1, 4]

[[boards]]
channel_mask = 255
record_length = 256
zle = true
thresholds = 40
"#;

    fn load_example() -> Conf {
        // the file format is picked from the extension
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();
        Conf::load(file.path()).unwrap()
    }

    #[test]
    fn loads_toml_with_defaults() {
        let conf = load_example();

        assert_eq!(conf.run.run_id, 12);
        assert_eq!(conf.run.queue_capacity, 10);
        assert_eq!(conf.run.base_name, "run");
        assert!(!conf.readout.use_interrupts);
        assert_eq!(conf.calibration.max_iterations, 20);
        assert_eq!(conf.boards.len(), 2);

        let first = &conf.boards[0];
        assert!(first.enabled);
        assert!(first.channel_enabled(1));
        assert!(!first.channel_enabled(2));
        assert_eq!(first.downsample_factors()[..3], [1, 4, 1]);
        assert_eq!(first.dc_offsets.get(5, 0), 0x8000);
        assert_eq!(conf.boards[1].thresholds.get(7, 0), 40);
    }

    #[test]
    fn snapshot_is_plain_toml() {
        let conf = load_example();
        let text = conf.snapshot().unwrap();
        assert!(text.contains("run_id = 12"));
        assert!(text.contains("[[boards]]"));
    }
}
