use crate::AcquisitionStatus;
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BusErrorKind {
    Bus,
    Comm,
    Generic,
}

/// A failed register or bulk transfer, carrying the address that failed.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
#[error("{kind:?} error at register 0x{address:04X} on board {board}")]
pub struct BusError {
    pub kind: BusErrorKind,
    pub board: usize,
    pub address: u32,
}

impl BusError {
    pub fn new(kind: BusErrorKind, board: usize, address: u32) -> Self {
        Self {
            kind,
            board,
            address,
        }
    }
}

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum WaitError {
    #[error("timed out waiting for interrupt")]
    Timeout,
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Register(#[from] BusError),

    #[error("board {board} failed to initialize: {reason}")]
    Init { board: usize, reason: String },

    #[error("board {board} reports unknown device code 0x{code:02X}")]
    UnknownDevice { board: usize, code: u32 },

    #[error("board {board} never became ready")]
    NotReady { board: usize },

    #[error("board {board} trigger counter {found} does not match {expected}")]
    TriggerCounterMismatch {
        board: usize,
        expected: u32,
        found: u32,
    },

    #[error("board {board} declared {declared} bytes but transferred {transferred}")]
    EventSizeMismatch {
        board: usize,
        declared: usize,
        transferred: usize,
    },

    #[error("board {board} had no data for a trigger seen by the other boards")]
    MissingSubEvent { board: usize },

    #[error("malformed data from board {board}: {reason}")]
    Malformed { board: usize, reason: String },

    #[error("driver used before the boards were initialized")]
    NotInitialized,

    #[error(transparent)]
    Block(#[from] BlockError),
}

impl DriverError {
    /// The sticky engine status this failure puts the acquisition into.
    pub fn status(&self) -> AcquisitionStatus {
        match self {
            Self::Register(e) => match e.kind {
                BusErrorKind::Bus => AcquisitionStatus::BusError,
                BusErrorKind::Comm => AcquisitionStatus::CommError,
                BusErrorKind::Generic => AcquisitionStatus::GenericError,
            },
            Self::Init { .. } | Self::UnknownDevice { .. } => AcquisitionStatus::InitFailure,
            _ => AcquisitionStatus::GenericError,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("an acquisition engine already exists in this process")]
    DuplicateInstance,
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("no run is in progress")]
    NotRunning,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("could not spawn readout thread: {0}")]
    ThreadSpawn(std::io::Error),
    #[error("readout thread panicked")]
    ThreadPanicked,
    /// The driver was lost with a readout thread that panicked or could not
    /// be spawned. The engine has to be rebuilt.
    #[error("hardware driver is no longer available")]
    DriverUnavailable,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("unsupported {what}: size {size}, version {version}")]
    UnsupportedHeader {
        what: &'static str,
        size: u32,
        version: u32,
    },

    #[error("no event file found for {0}")]
    NotFound(String),

    #[error("not ready: {0}")]
    InvalidState(&'static str),
}

#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockError {
    #[error("block index {index} out of range for {count} blocks")]
    OutOfRange { index: usize, count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_errors_map_to_status() {
        let bus = DriverError::from(BusError::new(BusErrorKind::Bus, 0, 0x8100));
        let comm = DriverError::from(BusError::new(BusErrorKind::Comm, 1, 0x8104));
        let other = DriverError::from(BusError::new(BusErrorKind::Generic, 1, 0x8104));
        assert_eq!(bus.status(), AcquisitionStatus::BusError);
        assert_eq!(comm.status(), AcquisitionStatus::CommError);
        assert_eq!(other.status(), AcquisitionStatus::GenericError);

        let mismatch = DriverError::TriggerCounterMismatch {
            board: 1,
            expected: 4,
            found: 5,
        };
        assert_eq!(mismatch.status(), AcquisitionStatus::GenericError);
        let init = DriverError::UnknownDevice { board: 0, code: 0x42 };
        assert_eq!(init.status(), AcquisitionStatus::InitFailure);
    }

    #[test]
    fn bus_error_names_the_address() {
        let e = BusError::new(BusErrorKind::Comm, 2, 0x1098);
        assert_eq!(e.to_string(), "Comm error at register 0x1098 on board 2");
    }
}
