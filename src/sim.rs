//! In-process stand-in for a crate of digitizer boards.
//!
//! Models the registers the driver touches: identification, offset DACs
//! with a settle time and a linear baseline response, software and
//! free-running triggers, an event FIFO per board, and the ready bits.
//! Faults can be injected per register, per board counter, or per transfer.

use crate::registers::*;
use crate::wire::{self, BoardHeader, HEADER_BYTES, HEADER_WORDS, ZLE_GOOD};
use crate::{BusError, BusErrorKind, RegisterBus, WaitError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

/// Address used to report failures of bulk event transfers.
pub const EVENT_BUFFER: u32 = 0x0000;
const DEFAULT_SETTLE_READS: u32 = 3;
const PULSE_AMPLITUDE: f64 = 400.0;

#[derive(Debug, Default)]
struct SimBoard {
    variant_code: u32,
    open: bool,
    registers: HashMap<u32, u32>,
    fifo: VecDeque<Vec<u8>>,
    event_counter: u32,
    settle: [u32; MAX_CHANNELS],
    /// Counter offset added once `event_counter` reaches the first value.
    counter_skew: Option<(u32, u32)>,
    never_ready: bool,
    stuck_dac: bool,
    /// Bytes withheld from every bulk transfer.
    short_transfer: usize,
}

impl SimBoard {
    fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    fn running(&self) -> bool {
        self.register(ACQ_CONTROL) & ACQ_CONTROL_RUN != 0
    }
}

#[derive(Debug)]
struct SimState {
    boards: Vec<SimBoard>,
    interrupts: bool,
    trigger_interval: Option<Duration>,
    last_trigger: Instant,
    trigger_time: u32,
    settle_reads: u32,
    slope: f64,
    intercept: f64,
    noise: f64,
    rng: StdRng,
    failures: HashMap<(usize, u32), BusErrorKind>,
}

impl SimState {
    fn check(&self, board: usize, address: u32) -> Result<(), BusError> {
        if board >= self.boards.len() {
            return Err(BusError::new(BusErrorKind::Comm, board, address));
        }
        match self.failures.get(&(board, address)) {
            Some(&kind) => Err(BusError::new(kind, board, address)),
            None => Ok(()),
        }
    }

    fn baseline(&self, offset: u32, adc_max: f64) -> f64 {
        (self.intercept + self.slope * offset as f64).clamp(0.0, adc_max)
    }

    fn poll_free_running(&mut self) {
        if let Some(interval) = self.trigger_interval {
            if self.last_trigger.elapsed() >= interval {
                self.last_trigger = Instant::now();
                self.trigger_all(true);
            }
        }
    }

    /// Record one event on every running board.
    fn trigger_all(&mut self, with_pulse: bool) {
        self.trigger_time = self.trigger_time.wrapping_add(1000);
        for index in 0..self.boards.len() {
            if self.boards[index].open && self.boards[index].running() {
                let event = self.build_event(index, with_pulse);
                let board = &mut self.boards[index];
                board.fifo.push_back(event);
                board.event_counter = board.event_counter.wrapping_add(1);
            }
        }
    }

    fn build_event(&mut self, index: usize, with_pulse: bool) -> Vec<u8> {
        let board = &self.boards[index];
        let channel_mask = (board.register(CHANNEL_ENABLE_MASK) & 0xFF) as u8;
        let samples = (board.register(CUSTOM_SIZE) as usize) & !1;
        let zle = board.register(CHANNEL_CONFIG) & CHANNEL_CONFIG_ZLE == CHANNEL_CONFIG_ZLE;
        let adc_max = DeviceVariant::from_code(board.variant_code)
            .map(|v| ((1u32 << v.constants().adc_bits) - 1) as f64)
            .unwrap_or(4095.0);
        let mut counter = board.event_counter;
        if let Some((after, skew)) = board.counter_skew {
            if counter >= after {
                counter = counter.wrapping_add(skew);
            }
        }
        let offsets: Vec<u32> = (0..MAX_CHANNELS)
            .map(|ch| board.register(channel_register(CH_DC_OFFSET, ch)))
            .collect();

        let header_words = HEADER_WORDS;
        let per_channel = samples / 2 + if zle { 2 } else { 0 };
        let nch = channel_mask.count_ones() as usize;
        let size_words = header_words + nch * per_channel;
        let mut data = vec![0u8; size_words * 4];
        BoardHeader {
            size_words: size_words as u32,
            board_id: index as u8,
            zle,
            pattern: 0,
            channel_mask,
            event_counter: counter,
            trigger_time: self.trigger_time,
        }
        .write(&mut data);

        let mut offset = HEADER_BYTES;
        for ch in (0..MAX_CHANNELS).filter(|ch| channel_mask & (1 << ch) != 0) {
            let baseline = self.baseline(offsets[ch], adc_max);
            let waveform: Vec<u16> = (0..samples)
                .map(|i| {
                    let mut value = baseline;
                    if self.noise > 0.0 {
                        value += self.rng.random_range(-self.noise..self.noise);
                    }
                    if with_pulse && i >= samples / 2 && i < samples / 2 + 8 {
                        value -= PULSE_AMPLITUDE;
                    }
                    value.round().clamp(0.0, adc_max) as u16
                })
                .collect();
            if zle {
                let words = (samples / 2) as u32;
                data[offset..offset + 4].copy_from_slice(&(words + 2).to_le_bytes());
                data[offset + 4..offset + 8].copy_from_slice(&(ZLE_GOOD | words).to_le_bytes());
                offset += 8;
            }
            wire::encode_samples(&waveform, &mut data[offset..offset + samples * 2]);
            offset += samples * 2;
        }
        data
    }
}

/// Shared handle on a simulated crate. Clones see the same boards, so a test
/// can keep one clone for fault injection while the driver owns another.
#[derive(Clone, Debug)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new(boards: usize, variant: DeviceVariant) -> Self {
        Self::with_codes(&vec![variant.code(); boards])
    }

    /// One board per identification code, including codes no driver knows.
    pub fn with_codes(codes: &[u32]) -> Self {
        let boards = codes
            .iter()
            .map(|&variant_code| SimBoard {
                variant_code,
                ..SimBoard::default()
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                boards,
                interrupts: true,
                trigger_interval: None,
                last_trigger: Instant::now(),
                trigger_time: 0,
                settle_reads: DEFAULT_SETTLE_READS,
                slope: 1.0 / 20.0,
                intercept: 20.0,
                noise: 0.0,
                rng: StdRng::seed_from_u64(0x5EED),
                failures: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_interrupts(&self, enabled: bool) {
        self.lock().interrupts = enabled;
    }

    /// Fire a trigger on every running board each `interval`.
    pub fn set_trigger_interval(&self, interval: Option<Duration>) {
        self.lock().trigger_interval = interval;
    }

    /// Baseline in ADC counts is `intercept + slope * offset`.
    pub fn set_baseline_response(&self, slope: f64, intercept: f64) {
        let mut state = self.lock();
        state.slope = slope;
        state.intercept = intercept;
    }

    pub fn set_noise(&self, amplitude: f64) {
        self.lock().noise = amplitude;
    }

    pub fn fail_register(&self, board: usize, address: u32, kind: BusErrorKind) {
        self.lock().failures.insert((board, address), kind);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// From its `after`-th event on, `board` reports a counter one ahead.
    pub fn skew_trigger_counter(&self, board: usize, after: u32) {
        if let Some(b) = self.lock().boards.get_mut(board) {
            b.counter_skew = Some((after, 1));
        }
    }

    pub fn set_never_ready(&self, board: usize) {
        if let Some(b) = self.lock().boards.get_mut(board) {
            b.never_ready = true;
        }
    }

    /// Offset DACs of `board` never report settled.
    pub fn set_stuck_dac(&self, board: usize) {
        if let Some(b) = self.lock().boards.get_mut(board) {
            b.stuck_dac = true;
        }
    }

    pub fn set_short_transfer(&self, board: usize, bytes: usize) {
        if let Some(b) = self.lock().boards.get_mut(board) {
            b.short_transfer = bytes;
        }
    }

    /// Fire one trigger on every running board.
    pub fn trigger(&self) {
        self.lock().trigger_all(true);
    }

    pub fn register(&self, board: usize, address: u32) -> Option<u32> {
        self.lock().boards.get(board).map(|b| b.register(address))
    }

    pub fn pending_events(&self, board: usize) -> usize {
        self.lock().boards.get(board).map_or(0, |b| b.fifo.len())
    }
}

impl RegisterBus for SimulatedBus {
    fn open(&mut self, board: usize) -> Result<(), BusError> {
        let mut state = self.lock();
        state.check(board, BOARD_INFO)?;
        state.boards[board].open = true;
        Ok(())
    }

    fn close(&mut self, board: usize) {
        if let Some(b) = self.lock().boards.get_mut(board) {
            b.open = false;
        }
    }

    fn read_register(&mut self, board: usize, address: u32) -> Result<u32, BusError> {
        let mut state = self.lock();
        state.check(board, address)?;
        if address == ACQ_STATUS {
            state.poll_free_running();
        }
        let b = &mut state.boards[board];
        let value = match address {
            BOARD_INFO => b.variant_code | (0x0A << 8),
            ROC_FIRMWARE => 0x0410_0C03,
            ACQ_STATUS => {
                let mut status = 0;
                if b.running() {
                    status |= ACQ_STATUS_RUN;
                }
                if !b.fifo.is_empty() {
                    status |= ACQ_STATUS_EVENT_READY;
                }
                if !b.never_ready {
                    status |= ACQ_STATUS_BOARD_READY;
                }
                status
            }
            EVENT_SIZE => b.fifo.front().map_or(0, |e| (e.len() / 4) as u32),
            EVENT_STORED => b.fifo.len() as u32,
            a if a & 0xF0FF == CH_STATUS && (a >> 8) & 0xF < MAX_CHANNELS as u32 => {
                let ch = ((a >> 8) & 0xF) as usize;
                if b.stuck_dac {
                    CH_STATUS_DAC_BUSY
                } else if b.settle[ch] > 0 {
                    b.settle[ch] -= 1;
                    CH_STATUS_DAC_BUSY
                } else {
                    0
                }
            }
            a => b.register(a),
        };
        Ok(value)
    }

    fn write_register(&mut self, board: usize, address: u32, value: u32) -> Result<(), BusError> {
        let mut state = self.lock();
        state.check(board, address)?;
        let settle_reads = state.settle_reads;
        match address {
            SW_RESET => {
                let b = &mut state.boards[board];
                b.registers.clear();
                b.fifo.clear();
                b.event_counter = 0;
            }
            SW_CLEAR => {
                let b = &mut state.boards[board];
                b.fifo.clear();
                b.event_counter = 0;
            }
            SW_TRIGGER => state.trigger_all(false),
            a if a & 0xF0FF == CH_DC_OFFSET && (a >> 8) & 0xF < MAX_CHANNELS as u32 => {
                let b = &mut state.boards[board];
                b.settle[((a >> 8) & 0xF) as usize] = settle_reads;
                b.registers.insert(a, value & 0xFFFF);
            }
            a => {
                state.boards[board].registers.insert(a, value);
            }
        }
        Ok(())
    }

    fn wait_for_interrupt(
        &mut self,
        board: usize,
        _mask: u32,
        timeout_ms: u32,
    ) -> Result<(), WaitError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            {
                let mut state = self.lock();
                state.check(board, VME_CONTROL)?;
                state.poll_free_running();
                if !state.boards[board].fifo.is_empty() {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_event_buffer(&mut self, board: usize, buf: &mut [u8]) -> Result<usize, BusError> {
        let mut state = self.lock();
        state.check(board, EVENT_BUFFER)?;
        let b = &mut state.boards[board];
        let Some(event) = b.fifo.pop_front() else {
            return Ok(0);
        };
        let len = event.len().saturating_sub(b.short_transfer).min(buf.len());
        buf[..len].copy_from_slice(&event[..len]);
        Ok(len)
    }

    fn supports_interrupts(&self) -> bool {
        self.lock().interrupts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(bus: &mut SimulatedBus, board: usize, mask: u32, samples: u32) {
        bus.open(board).unwrap();
        bus.write_register(board, CHANNEL_ENABLE_MASK, mask).unwrap();
        bus.write_register(board, CUSTOM_SIZE, samples).unwrap();
        bus.write_register(board, ACQ_CONTROL, ACQ_CONTROL_RUN).unwrap();
    }

    #[test]
    fn software_trigger_fills_running_boards() {
        let mut bus = SimulatedBus::new(2, DeviceVariant::V1720);
        armed(&mut bus, 0, 0b11, 16);
        bus.open(1).unwrap();

        bus.write_register(0, SW_TRIGGER, 1).unwrap();
        assert_eq!(bus.pending_events(0), 1);
        assert_eq!(bus.pending_events(1), 0);

        let words = bus.read_register(0, EVENT_SIZE).unwrap() as usize;
        assert_eq!(words, HEADER_WORDS + 2 * 8);
        let status = bus.read_register(0, ACQ_STATUS).unwrap();
        assert_ne!(status & ACQ_STATUS_EVENT_READY, 0);

        let mut buf = vec![0u8; words * 4];
        assert_eq!(bus.read_event_buffer(0, &mut buf).unwrap(), words * 4);
        let header = BoardHeader::parse(&buf).unwrap();
        assert_eq!(header.channel_mask, 0b11);
        assert_eq!(header.event_counter, 0);
    }

    #[test]
    fn dc_offset_sets_baseline_after_settling() {
        let mut bus = SimulatedBus::new(1, DeviceVariant::V1720);
        armed(&mut bus, 0, 0b1, 8);
        bus.write_register(0, channel_register(CH_DC_OFFSET, 0), 1600).unwrap();
        let status = channel_register(CH_STATUS, 0);
        for _ in 0..DEFAULT_SETTLE_READS {
            assert_eq!(bus.read_register(0, status).unwrap(), CH_STATUS_DAC_BUSY);
        }
        assert_eq!(bus.read_register(0, status).unwrap(), 0);

        bus.write_register(0, SW_TRIGGER, 1).unwrap();
        let mut buf = vec![0u8; (HEADER_WORDS + 4) * 4];
        bus.read_event_buffer(0, &mut buf).unwrap();
        let samples = wire::decode_samples(&buf[HEADER_BYTES..]);
        assert!(samples.iter().all(|&s| s == 100));
    }

    #[test]
    fn injected_failures_carry_the_address() {
        let mut bus = SimulatedBus::new(1, DeviceVariant::V1724);
        bus.open(0).unwrap();
        bus.fail_register(0, ACQ_CONTROL, BusErrorKind::Bus);
        let err = bus.write_register(0, ACQ_CONTROL, 0).unwrap_err();
        assert_eq!(err, BusError::new(BusErrorKind::Bus, 0, ACQ_CONTROL));
        assert!(bus.read_register(3, BOARD_INFO).is_err());
        bus.clear_failures();
        assert!(bus.write_register(0, ACQ_CONTROL, 0).is_ok());
    }

    #[test]
    fn interrupt_wait_times_out_without_data() {
        let mut bus = SimulatedBus::new(1, DeviceVariant::V1720);
        armed(&mut bus, 0, 0b1, 8);
        assert_eq!(bus.wait_for_interrupt(0, 1, 5), Err(WaitError::Timeout));
        bus.trigger();
        assert_eq!(bus.wait_for_interrupt(0, 1, 5), Ok(()));
    }
}
