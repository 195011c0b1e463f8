use crate::BlockError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Bytes currently held by every live `DataBlock` in the process.
static LIVE_BLOCK_BYTES: AtomicU64 = AtomicU64::new(0);
/// Next id handed out to events created with `RawEvent::new(true)`.
static NEXT_EVENT_ID: AtomicU32 = AtomicU32::new(0);

/// Total bytes held by all live data blocks.
pub fn live_block_bytes() -> u64 {
    LIVE_BLOCK_BYTES.load(Ordering::SeqCst)
}

/// The id the next counter-stamped event will receive.
pub fn peek_next_event_id() -> u32 {
    NEXT_EVENT_ID.load(Ordering::SeqCst)
}

pub(crate) fn now_seconds() -> u32 {
    time::OffsetDateTime::now_utc().unix_timestamp() as u32
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockType {
    Digitizer = 0,
    Simulated = 1,
}

impl BlockType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Digitizer),
            1 => Some(Self::Simulated),
            _ => None,
        }
    }
}

/// One typed, resizable segment of event data.
///
/// The block's size is always the length of its buffer, and every byte it
/// holds is counted in the process-wide live byte total until it is dropped.
#[derive(Debug)]
pub struct DataBlock {
    block_type: BlockType,
    bytes: Vec<u8>,
}

impl DataBlock {
    pub fn new(block_type: BlockType, size: usize) -> Self {
        LIVE_BLOCK_BYTES.fetch_add(size as u64, Ordering::SeqCst);
        Self {
            block_type,
            bytes: vec![0u8; size],
        }
    }

    /// Take ownership of an existing buffer, e.g. one decompressed from disk.
    pub fn from_bytes(block_type: BlockType, bytes: Vec<u8>) -> Self {
        LIVE_BLOCK_BYTES.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        Self { block_type, bytes }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view of the data. The length cannot change through it.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn grow(&mut self, new_size: usize) {
        if new_size > self.bytes.len() {
            LIVE_BLOCK_BYTES.fetch_add((new_size - self.bytes.len()) as u64, Ordering::SeqCst);
            self.bytes.resize(new_size, 0);
        }
    }

    fn truncate(&mut self, new_size: usize) {
        if new_size < self.bytes.len() {
            LIVE_BLOCK_BYTES.fetch_sub((self.bytes.len() - new_size) as u64, Ordering::SeqCst);
            self.bytes.truncate(new_size);
        }
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        LIVE_BLOCK_BYTES.fetch_sub(self.bytes.len() as u64, Ordering::SeqCst);
    }
}

/// All data recorded for one trigger.
///
/// Owns its blocks exclusively. Once posted to the acquisition queue the
/// event moves to whichever consumer dequeues it.
#[derive(Debug)]
pub struct RawEvent {
    event_id: u32,
    timestamp: u32,
    run_id: u32,
    data_size: u64,
    blocks: Vec<DataBlock>,
}

impl RawEvent {
    /// Create an empty event.
    ///
    /// With `increment_id_counter` the event takes the next process-wide id
    /// and the current wall-clock second; otherwise id and timestamp are zero.
    pub fn new(increment_id_counter: bool) -> Self {
        let (event_id, timestamp) = if increment_id_counter {
            (NEXT_EVENT_ID.fetch_add(1, Ordering::SeqCst), now_seconds())
        } else {
            (0, 0)
        };
        Self {
            event_id,
            timestamp,
            run_id: 0,
            data_size: 0,
            blocks: Vec::new(),
        }
    }

    /// Create an event with explicit identity, bypassing the id counter.
    pub fn with_identity(event_id: u32, timestamp: u32, run_id: u32) -> Self {
        Self {
            event_id,
            timestamp,
            run_id,
            data_size: 0,
            blocks: Vec::new(),
        }
    }

    pub fn add_block(&mut self, block_type: BlockType, size: usize) -> usize {
        self.push_block(DataBlock::new(block_type, size))
    }

    pub fn push_block(&mut self, block: DataBlock) -> usize {
        self.data_size += block.size() as u64;
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    pub fn remove_block(&mut self, index: usize) -> Result<DataBlock, BlockError> {
        if index >= self.blocks.len() {
            return Err(self.out_of_range(index));
        }
        let block = self.blocks.remove(index);
        self.data_size -= block.size() as u64;
        Ok(block)
    }

    pub fn get_block(&self, index: usize) -> Option<&DataBlock> {
        self.blocks.get(index)
    }

    pub fn get_block_mut(&mut self, index: usize) -> Option<&mut DataBlock> {
        self.blocks.get_mut(index)
    }

    /// Grow a block to `new_size` bytes. Smaller sizes leave it untouched.
    pub fn resize_block(&mut self, index: usize, new_size: usize) -> Result<u32, BlockError> {
        let err = self.out_of_range(index);
        let block = self.blocks.get_mut(index).ok_or(err)?;
        let before = block.size() as u64;
        block.grow(new_size);
        self.data_size += block.size() as u64 - before;
        Ok(block.size())
    }

    /// Drop everything past `new_size` bytes, used once the real transfer
    /// length of a block is known.
    pub fn truncate_block(&mut self, index: usize, new_size: usize) -> Result<u32, BlockError> {
        let err = self.out_of_range(index);
        let block = self.blocks.get_mut(index).ok_or(err)?;
        let before = block.size() as u64;
        block.truncate(new_size);
        self.data_size -= before - block.size() as u64;
        Ok(block.size())
    }

    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Sum of the sizes of all blocks in this event.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    pub fn set_event_id(&mut self, event_id: u32) {
        self.event_id = event_id;
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    pub fn run_id(&self) -> u32 {
        self.run_id
    }

    pub fn set_run_id(&mut self, run_id: u32) {
        self.run_id = run_id;
    }

    fn out_of_range(&self, index: usize) -> BlockError {
        BlockError::OutOfRange {
            index,
            count: self.blocks.len(),
        }
    }
}
