//! On-disk layout of the event container.
//!
//! A file opens with a [`GlobalHeader`], then holds event records: an
//! [`EventHeader`] followed by `nblocks` blocks, each a [`BlockHeader`] and
//! its zlib-compressed payload. All fields are little-endian u32.
//! Files written before the global header existed start directly with
//! 12-byte event headers and carry a single implicit block per event.

use crate::cursor::{put_u32, ByteCursor};
use crate::StorageError;

pub const MAGIC: u32 = 0xdec0_ded1;

pub const GLOBAL_HEADER_VERSION: u32 = 1;
pub const GLOBAL_HEADER_SIZE: u32 = 13 * 4;
pub const EVENT_HEADER_VERSION: u32 = 1;
pub const EVENT_HEADER_SIZE: u32 = 4 * 4;
pub const LEGACY_EVENT_HEADER_SIZE: u32 = 3 * 4;
pub const BLOCK_HEADER_SIZE: u32 = 3 * 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GlobalHeader {
    pub magic: u32,
    pub global_header_size: u32,
    pub global_header_version: u32,
    pub event_header_size: u32,
    pub event_header_version: u32,
    pub file_size: u32,
    pub start_time: u32,
    pub end_time: u32,
    pub run_id: u32,
    pub file_index: u32,
    pub nevents: u32,
    pub event_id_min: u32,
    pub event_id_max: u32,
}

impl GlobalHeader {
    /// Header of a freshly opened file, before any event was appended.
    pub fn blank(run_id: u32, file_index: u32, start_time: u32) -> Self {
        Self {
            magic: MAGIC,
            global_header_size: GLOBAL_HEADER_SIZE,
            global_header_version: GLOBAL_HEADER_VERSION,
            event_header_size: EVENT_HEADER_SIZE,
            event_header_version: EVENT_HEADER_VERSION,
            file_size: GLOBAL_HEADER_SIZE,
            start_time,
            end_time: 0,
            run_id,
            file_index,
            nevents: 0,
            event_id_min: 0,
            event_id_max: 0,
        }
    }

    /// Stand-in for files that predate the global header.
    pub fn legacy() -> Self {
        Self {
            event_header_size: LEGACY_EVENT_HEADER_SIZE,
            ..Self::default()
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.global_header_version == 0
    }

    /// Fold one appended event into the per-file statistics.
    pub fn record_event(&mut self, event_id: u32, event_size: u32) {
        if self.nevents == 0 {
            self.event_id_min = event_id;
            self.event_id_max = event_id;
        } else {
            self.event_id_min = self.event_id_min.min(event_id);
            self.event_id_max = self.event_id_max.max(event_id);
        }
        self.nevents += 1;
        self.file_size = self.file_size.saturating_add(event_size);
    }

    /// Whether `event_id` can be in this file according to its id range.
    /// Files never closed (end time still 0) carry no usable range.
    pub fn may_contain(&self, event_id: u32) -> bool {
        self.is_legacy()
            || self.end_time == 0
            || (self.nevents > 0 && event_id >= self.event_id_min && event_id <= self.event_id_max)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(GLOBAL_HEADER_SIZE as usize);
        for field in [
            self.magic,
            self.global_header_size,
            self.global_header_version,
            self.event_header_size,
            self.event_header_version,
            self.file_size,
            self.start_time,
            self.end_time,
            self.run_id,
            self.file_index,
            self.nevents,
            self.event_id_min,
            self.event_id_max,
        ] {
            put_u32(&mut buf, field);
        }
        buf
    }

    /// Parse the fixed part of a header. Returns `None` on a short buffer.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut c = ByteCursor::new(data);
        Some(Self {
            magic: c.read_u32()?,
            global_header_size: c.read_u32()?,
            global_header_version: c.read_u32()?,
            event_header_size: c.read_u32()?,
            event_header_version: c.read_u32()?,
            file_size: c.read_u32()?,
            start_time: c.read_u32()?,
            end_time: c.read_u32()?,
            run_id: c.read_u32()?,
            file_index: c.read_u32()?,
            nevents: c.read_u32()?,
            event_id_min: c.read_u32()?,
            event_id_max: c.read_u32()?,
        })
    }

    /// Reject layouts newer than this reader understands.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.global_header_size > GLOBAL_HEADER_SIZE
            || self.global_header_version > GLOBAL_HEADER_VERSION
        {
            return Err(StorageError::UnsupportedHeader {
                what: "global header",
                size: self.global_header_size,
                version: self.global_header_version,
            });
        }
        if self.event_header_size > EVENT_HEADER_SIZE
            || self.event_header_version > EVENT_HEADER_VERSION
        {
            return Err(StorageError::UnsupportedHeader {
                what: "event header",
                size: self.event_header_size,
                version: self.event_header_version,
            });
        }
        if self.global_header_size < GLOBAL_HEADER_SIZE
            || (self.event_header_version >= 1 && self.event_header_size < EVENT_HEADER_SIZE)
        {
            return Err(StorageError::Corrupted(format!(
                "header sizes {}/{} too small for version {}",
                self.global_header_size, self.event_header_size, self.global_header_version
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EventHeader {
    /// Bytes of the whole record, this header included.
    pub event_size: u32,
    pub event_id: u32,
    pub timestamp: u32,
    pub nblocks: u32,
}

impl EventHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.event_size);
        put_u32(buf, self.event_id);
        put_u32(buf, self.timestamp);
        put_u32(buf, self.nblocks);
    }

    /// Parse a header of `size` bytes. Legacy 12-byte headers describe a
    /// single block.
    pub fn decode(data: &[u8], size: u32) -> Option<Self> {
        let mut c = ByteCursor::new(data);
        let event_size = c.read_u32()?;
        let event_id = c.read_u32()?;
        let timestamp = c.read_u32()?;
        let nblocks = if size >= EVENT_HEADER_SIZE {
            c.read_u32()?
        } else {
            1
        };
        Some(Self {
            event_size,
            event_id,
            timestamp,
            nblocks,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockHeader {
    /// Compressed payload plus this header.
    pub total_blocksize_disk: u32,
    pub datasize: u32,
    pub block_type: u32,
}

impl BlockHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.total_blocksize_disk);
        put_u32(buf, self.datasize);
        put_u32(buf, self.block_type);
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut c = ByteCursor::new(data);
        Some(Self {
            total_blocksize_disk: c.read_u32()?,
            datasize: c.read_u32()?,
            block_type: c.read_u32()?,
        })
    }

    pub fn payload_size(&self) -> usize {
        self.total_blocksize_disk.saturating_sub(BLOCK_HEADER_SIZE) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_header_layout_is_fixed() {
        let mut header = GlobalHeader::blank(7, 2, 1000);
        header.record_event(5, 100);
        header.record_event(3, 50);
        header.end_time = 1001;
        let bytes = header.encode();
        assert_eq!(bytes.len(), GLOBAL_HEADER_SIZE as usize);
        assert_eq!(&bytes[..4], &[0xd1, 0xde, 0xc0, 0xde]);
        let decoded = GlobalHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.file_size, GLOBAL_HEADER_SIZE + 150);
        assert_eq!((decoded.event_id_min, decoded.event_id_max), (3, 5));
        assert!(decoded.may_contain(4));
        assert!(!decoded.may_contain(6));
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn newer_layouts_are_rejected() {
        let mut header = GlobalHeader::blank(0, 0, 0);
        header.global_header_version = 2;
        assert!(matches!(
            header.validate(),
            Err(StorageError::UnsupportedHeader { what: "global header", .. })
        ));
        let mut header = GlobalHeader::blank(0, 0, 0);
        header.event_header_size = 20;
        assert!(matches!(
            header.validate(),
            Err(StorageError::UnsupportedHeader { what: "event header", .. })
        ));
    }

    #[test]
    fn legacy_event_header_has_one_block() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 40);
        put_u32(&mut buf, 9);
        put_u32(&mut buf, 1234);
        let header = EventHeader::decode(&buf, LEGACY_EVENT_HEADER_SIZE).unwrap();
        assert_eq!(header.nblocks, 1);
        assert_eq!(header.event_id, 9);
        assert!(EventHeader::decode(&buf, EVENT_HEADER_SIZE).is_none());
    }
}
