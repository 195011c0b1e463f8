mod bus;
pub mod calibration;
mod compression;
mod config;
pub mod cursor;
pub mod digitizer;
pub mod downsample;
mod engine;
mod error;
mod event;
pub mod format;
mod monitor;
mod reader;
pub mod registers;
mod sim;
pub mod utils;
pub mod wire;
mod writer;

pub use bus::RegisterBus;
pub use calibration::{ChannelCalibration, OffsetSearch, SearchState};
pub use compression::{compress_bound, decompress, BlockCompressor};
pub use config::{
    BoardSettings, CalibrationSettings, ChannelValues, Conf, ReadoutSettings, RunSettings,
    SimulationSettings,
};
pub use digitizer::{DigitizerDriver, DriverState};
pub use engine::{
    AcquisitionEngine, AcquisitionStatus, EngineLease, EngineStats, EventSink, HardwareDriver,
    DEFAULT_QUEUE_CAPACITY,
};
pub use error::{
    BlockError, BusError, BusErrorKind, DriverError, EngineError, StorageError, WaitError,
};
pub use event::{live_block_bytes, peek_next_event_id, BlockType, DataBlock, RawEvent};
pub use monitor::{Monitor, MonitorExit};
pub use reader::EventReader;
pub use registers::DeviceVariant;
pub use sim::SimulatedBus;
pub use writer::{series_file, EventWriter, WriterSettings};
