use crate::{BusError, WaitError};

/// Register-level access to a crate of digitizer boards.
///
/// Boards are addressed by their index in the configured board list. The
/// vendor transport behind this trait is out of this crate's hands; a
/// simulated implementation lives in [`crate::SimulatedBus`].
pub trait RegisterBus: Send {
    /// Open the device handle for `board`.
    fn open(&mut self, board: usize) -> Result<(), BusError>;

    fn close(&mut self, board: usize);

    fn read_register(&mut self, board: usize, address: u32) -> Result<u32, BusError>;

    fn write_register(&mut self, board: usize, address: u32, value: u32) -> Result<(), BusError>;

    /// Block until `board` raises an interrupt matching `mask` or `timeout_ms` passes.
    fn wait_for_interrupt(&mut self, board: usize, mask: u32, timeout_ms: u32)
        -> Result<(), WaitError>;

    /// Bulk-read the board's next buffered event into `buf`, returning the
    /// number of bytes actually transferred.
    fn read_event_buffer(&mut self, board: usize, buf: &mut [u8]) -> Result<usize, BusError>;

    /// Whether the transport can deliver interrupts. Without them the
    /// readout loop polls status registers instead.
    fn supports_interrupts(&self) -> bool;
}

impl<B: RegisterBus + ?Sized> RegisterBus for Box<B> {
    fn open(&mut self, board: usize) -> Result<(), BusError> {
        (**self).open(board)
    }

    fn close(&mut self, board: usize) {
        (**self).close(board)
    }

    fn read_register(&mut self, board: usize, address: u32) -> Result<u32, BusError> {
        (**self).read_register(board, address)
    }

    fn write_register(&mut self, board: usize, address: u32, value: u32) -> Result<(), BusError> {
        (**self).write_register(board, address, value)
    }

    fn wait_for_interrupt(
        &mut self,
        board: usize,
        mask: u32,
        timeout_ms: u32,
    ) -> Result<(), WaitError> {
        (**self).wait_for_interrupt(board, mask, timeout_ms)
    }

    fn read_event_buffer(&mut self, board: usize, buf: &mut [u8]) -> Result<usize, BusError> {
        (**self).read_event_buffer(board, buf)
    }

    fn supports_interrupts(&self) -> bool {
        (**self).supports_interrupts()
    }
}
