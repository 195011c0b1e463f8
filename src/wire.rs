//! Event data as it comes off a board.
//!
//! Every board event starts with four 32-bit words:
//!
//! ```text
//! word 0: 0xA << 28 | event size in words (header included)
//! word 1: board id << 27 | ZLE flag (bit 24) | pattern << 8 | channel mask
//! word 2: event counter (24 bits)
//! word 3: trigger time tag
//! ```
//!
//! followed by one payload per channel set in the mask, in channel order.
//! Plain payloads are `record_length` little-endian u16 samples. ZLE payloads
//! open with a size word (in words, itself included) followed by control
//! words and the kept samples.

use crate::cursor::{write_u32_at, ByteCursor};

pub const HEADER_TAG: u32 = 0xA;
pub const HEADER_WORDS: usize = 4;
pub const HEADER_BYTES: usize = HEADER_WORDS * 4;
pub const EVENT_COUNTER_MASK: u32 = 0x00FF_FFFF;
const SIZE_MASK: u32 = 0x0FFF_FFFF;
const ZLE_FLAG: u32 = 1 << 24;
/// Control word flag marking a run of kept samples.
pub const ZLE_GOOD: u32 = 1 << 31;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BoardHeader {
    pub size_words: u32,
    pub board_id: u8,
    pub zle: bool,
    pub pattern: u16,
    pub channel_mask: u8,
    pub event_counter: u32,
    pub trigger_time: u32,
}

impl BoardHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = ByteCursor::new(data);
        let word0 = cursor.read_u32()?;
        let word1 = cursor.read_u32()?;
        let word2 = cursor.read_u32()?;
        let word3 = cursor.read_u32()?;
        if word0 >> 28 != HEADER_TAG {
            return None;
        }
        Some(Self {
            size_words: word0 & SIZE_MASK,
            board_id: (word1 >> 27) as u8,
            zle: word1 & ZLE_FLAG != 0,
            pattern: ((word1 >> 8) & 0xFFFF) as u16,
            channel_mask: (word1 & 0xFF) as u8,
            event_counter: word2 & EVENT_COUNTER_MASK,
            trigger_time: word3,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let word1 = ((self.board_id as u32 & 0x1F) << 27)
            | if self.zle { ZLE_FLAG } else { 0 }
            | ((self.pattern as u32) << 8)
            | self.channel_mask as u32;
        write_u32_at(out, 0, (HEADER_TAG << 28) | (self.size_words & SIZE_MASK));
        write_u32_at(out, 4, word1);
        write_u32_at(out, 8, self.event_counter & EVENT_COUNTER_MASK);
        write_u32_at(out, 12, self.trigger_time);
    }

    pub fn size_bytes(&self) -> usize {
        self.size_words as usize * 4
    }

    pub fn channel_count(&self) -> usize {
        self.channel_mask.count_ones() as usize
    }

    pub fn channels(&self) -> impl Iterator<Item = usize> + '_ {
        (0..8).filter(move |ch| self.channel_mask & (1 << ch) != 0)
    }

    /// Samples per channel of a plain (non-ZLE) event.
    pub fn samples_per_channel(&self) -> usize {
        match self.channel_count() {
            0 => 0,
            n => (self.size_bytes().saturating_sub(HEADER_BYTES)) / 2 / n,
        }
    }
}

/// Rewrite just the size field of a header already in `out`.
pub fn set_size_words(out: &mut [u8], size_words: u32) {
    write_u32_at(out, 0, (HEADER_TAG << 28) | (size_words & SIZE_MASK));
}

pub fn decode_samples(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn encode_samples(samples: &[u16], out: &mut [u8]) {
    for (pair, sample) in out.chunks_exact_mut(2).zip(samples) {
        pair.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Plain payload of channel slot `slot` (0-based position within the mask).
pub fn plain_channel<'a>(
    data: &'a [u8],
    header: &BoardHeader,
    slot: usize,
) -> Option<&'a [u8]> {
    let len = header.samples_per_channel() * 2;
    let start = HEADER_BYTES + slot * len;
    data.get(start..start + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let header = BoardHeader {
            size_words: 4 + 2 * 8,
            board_id: 3,
            zle: true,
            pattern: 0xBEEF,
            channel_mask: 0b1000_0101,
            event_counter: 0x12_3456,
            trigger_time: 99,
        };
        let mut buf = [0u8; HEADER_BYTES];
        header.write(&mut buf);
        assert_eq!(BoardHeader::parse(&buf), Some(header));
        assert_eq!(header.channel_count(), 3);
        assert_eq!(header.channels().collect::<Vec<_>>(), vec![0, 2, 7]);
    }

    #[test]
    fn rejects_missing_tag_and_short_input() {
        let mut buf = [0u8; HEADER_BYTES];
        assert_eq!(BoardHeader::parse(&buf), None);
        buf[3] = 0xA0;
        assert!(BoardHeader::parse(&buf).is_some());
        assert_eq!(BoardHeader::parse(&buf[..12]), None);
    }

    #[test]
    fn plain_channel_slices_follow_mask_order() {
        let header = BoardHeader {
            size_words: (HEADER_WORDS + 2 * 2) as u32,
            board_id: 0,
            zle: false,
            pattern: 0,
            channel_mask: 0b11,
            event_counter: 1,
            trigger_time: 0,
        };
        let mut data = vec![0u8; header.size_bytes()];
        header.write(&mut data);
        encode_samples(&[1, 2, 3, 4, 5, 6, 7, 8], &mut data[HEADER_BYTES..]);
        assert_eq!(header.samples_per_channel(), 4);
        let second = plain_channel(&data, &header, 1).unwrap();
        assert_eq!(decode_samples(second), vec![5, 6, 7, 8]);
    }
}
