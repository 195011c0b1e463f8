use crate::wire::{self, BoardHeader, HEADER_BYTES, HEADER_WORDS};
use ndarray::{Array2, Axis};

/// Largest divisor of `samples` that does not exceed `factor`.
///
/// A factor that does not divide the record evenly is quietly reduced rather
/// than rejected, so a mistyped setting never stops a run.
pub fn effective_factor(samples: usize, factor: usize) -> usize {
    if samples == 0 || factor <= 1 {
        return 1;
    }
    (1..=factor.min(samples))
        .rev()
        .find(|f| samples % f == 0)
        .unwrap_or(1)
}

/// Block-average `samples` over groups of `factor`.
pub fn average_samples(samples: &[u16], factor: usize) -> Vec<u16> {
    let factor = effective_factor(samples.len(), factor);
    if factor == 1 {
        return samples.to_vec();
    }
    let groups = samples.len() / factor;
    let values: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let Ok(matrix) = Array2::from_shape_vec((groups, factor), values) else {
        return samples.to_vec();
    };
    match matrix.mean_axis(Axis(1)) {
        Some(means) => means.iter().map(|m| m.round() as u16).collect(),
        None => samples.to_vec(),
    }
}

/// Down-sample every plain channel of one board event in place.
///
/// `factors[ch]` is the averaging factor of channel `ch` (1 or missing means
/// untouched). Channel payloads are compacted towards the header and the
/// header's size word is rewritten. ZLE events are left as they are. Returns
/// the new length of the board event in bytes, or `None` when `data` stops
/// short of a channel the header lists.
pub fn downsample_board(data: &mut [u8], factors: &[u32]) -> Option<usize> {
    let header = BoardHeader::parse(data)?;
    let original_len = header.size_bytes().min(data.len());
    if header.zle
        || !header
            .channels()
            .any(|ch| factors.get(ch).copied().unwrap_or(1) > 1)
    {
        return Some(original_len);
    }

    let samples = header.samples_per_channel();
    let mut write = HEADER_BYTES;
    for (slot, ch) in header.channels().enumerate() {
        let payload = wire::plain_channel(data, &header, slot)?;
        let factor = factors.get(ch).copied().unwrap_or(1) as usize;
        let mut reduced = average_samples(&wire::decode_samples(payload), factor);
        // keep payloads word aligned
        if reduced.len() % 2 == 1 {
            if let Some(&last) = reduced.last() {
                reduced.push(last);
            }
        }
        let len = reduced.len() * 2;
        debug_assert!(len <= samples * 2);
        wire::encode_samples(&reduced, &mut data[write..write + len]);
        write += len;
    }

    wire::set_size_words(data, (write / 4) as u32);
    debug_assert!(write / 4 >= HEADER_WORDS);
    Some(write)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_event(channel_mask: u8, channels: &[Vec<u16>], zle: bool) -> Vec<u8> {
        let samples: usize = channels.iter().map(|c| c.len()).sum();
        let header = BoardHeader {
            size_words: (HEADER_WORDS + samples / 2) as u32,
            board_id: 0,
            zle,
            pattern: 0,
            channel_mask,
            event_counter: 5,
            trigger_time: 0,
        };
        let mut data = vec![0u8; header.size_bytes()];
        header.write(&mut data);
        let mut offset = HEADER_BYTES;
        for channel in channels {
            wire::encode_samples(channel, &mut data[offset..offset + channel.len() * 2]);
            offset += channel.len() * 2;
        }
        data
    }

    #[test]
    fn factor_falls_back_to_a_divisor() {
        assert_eq!(effective_factor(12, 4), 4);
        assert_eq!(effective_factor(12, 5), 4);
        assert_eq!(effective_factor(7, 3), 1);
        assert_eq!(effective_factor(10, 100), 10);
        assert_eq!(effective_factor(0, 4), 1);
    }

    #[test]
    fn averages_groups() {
        assert_eq!(average_samples(&[1, 3, 5, 7, 10, 20], 2), vec![2, 6, 15]);
        // 5 does not divide 6, so 3 is used
        assert_eq!(average_samples(&[3, 3, 3, 9, 9, 9], 5), vec![3, 9]);
        assert_eq!(average_samples(&[4, 5], 1), vec![4, 5]);
    }

    #[test]
    fn compacts_channels_and_rewrites_size() {
        let ch0: Vec<u16> = vec![10, 10, 20, 20, 30, 30, 40, 40];
        let ch1: Vec<u16> = (0..8).collect();
        let mut data = board_event(0b11, &[ch0, ch1.clone()], false);
        let mut factors = [1u32; 8];
        factors[0] = 2;

        let len = downsample_board(&mut data, &factors).unwrap();
        assert_eq!(len, HEADER_BYTES + 4 * 2 + 8 * 2);
        let header = BoardHeader::parse(&data).unwrap();
        assert_eq!(header.size_bytes(), len);
        assert_eq!(
            wire::decode_samples(&data[HEADER_BYTES..HEADER_BYTES + 8]),
            vec![10, 20, 30, 40]
        );
        assert_eq!(wire::decode_samples(&data[HEADER_BYTES + 8..len]), ch1);
    }

    #[test]
    fn odd_averaged_length_is_padded() {
        let ch0: Vec<u16> = vec![1, 1, 1, 2, 2, 2];
        let mut data = board_event(0b1, &[ch0], false);
        let mut factors = [1u32; 8];
        factors[0] = 3;
        let len = downsample_board(&mut data, &factors).unwrap();
        assert_eq!(len, HEADER_BYTES + 4);
        assert_eq!(wire::decode_samples(&data[HEADER_BYTES..len]), vec![1, 2]);

        let ch0: Vec<u16> = vec![6; 6];
        let mut data = board_event(0b1, &[ch0], false);
        factors[0] = 2;
        let len = downsample_board(&mut data, &factors).unwrap();
        assert_eq!(wire::decode_samples(&data[HEADER_BYTES..len]), vec![6, 6, 6, 6]);
    }

    #[test]
    fn zle_events_are_untouched() {
        let ch0: Vec<u16> = vec![1, 2, 3, 4];
        let mut data = board_event(0b1, &[ch0], true);
        let before = data.clone();
        let len = downsample_board(&mut data, &[4; 8]).unwrap();
        assert_eq!(len, before.len());
        assert_eq!(data, before);
    }

    #[test]
    fn missing_channel_payload_is_rejected() {
        let ch0: Vec<u16> = vec![5; 8];
        let ch1: Vec<u16> = vec![7; 8];
        let mut data = board_event(0b11, &[ch0, ch1], false);
        let len = data.len();
        let before = data[..HEADER_BYTES].to_vec();
        assert_eq!(downsample_board(&mut data[..len - 4], &[2; 8]), None);
        // the size word is not rewritten for a rejected event
        assert_eq!(data[..HEADER_BYTES], before[..]);
    }
}
