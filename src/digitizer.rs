//! Register-level driver for a crate of waveform digitizers.
//!
//! The driver walks through Initialize (open, reset, identify), Calibrate
//! (DC-offset search per flagged channel), Update (program the run
//! configuration) and finally the readout loop, which assembles one
//! [`RawEvent`] per trigger from every enabled board.

use crate::calibration::{ChannelCalibration, OffsetSearch, SearchState};
use crate::config::{BoardSettings, CalibrationSettings, Conf, ReadoutSettings};
use crate::downsample::downsample_board;
use crate::engine::{EventSink, HardwareDriver};
use crate::event::BlockType;
use crate::registers::*;
use crate::wire::{self, BoardHeader, HEADER_BYTES};
use crate::{BlockError, DriverError, RawEvent, RegisterBus, WaitError};
use log::{debug, error, info, warn};
use ndarray::Array1;
use std::{
    thread,
    time::{Duration, Instant},
};

/// Pause between polls of a status register.
const POLL_INTERVAL: Duration = Duration::from_micros(100);
/// Interrupt mask asking for any event-ready condition.
const EVENT_READY_IRQ: u32 = 0xFF;
/// Largest buffer-organization code the boards accept.
const MAX_BUFFER_CODE: u32 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverState {
    Closed,
    Initialized,
    Configured,
}

#[derive(Debug)]
struct Board {
    /// Position in the configured board list, used as the bus address.
    index: usize,
    settings: BoardSettings,
    variant: Option<DeviceVariant>,
    dc_offsets: [u32; MAX_CHANNELS],
    downsample: Vec<u32>,
}

impl Board {
    fn constants(&self) -> Option<VariantConstants> {
        self.variant.map(|v| v.constants())
    }

    /// Bytes one trigger produces on this board, header included.
    fn expected_event_bytes(&self) -> usize {
        let per_channel = self.settings.record_length as usize * 2
            + if self.settings.zle { 8 } else { 0 };
        HEADER_BYTES + self.settings.channel_mask.count_ones() as usize * per_channel
    }
}

pub struct DigitizerDriver<B: RegisterBus> {
    bus: B,
    boards: Vec<Board>,
    readout: ReadoutSettings,
    calibration: CalibrationSettings,
    run_id: u32,
    state: DriverState,
    expected_event_bytes: usize,
    calibrations: Vec<ChannelCalibration>,
}

impl<B: RegisterBus> DigitizerDriver<B> {
    /// Driver for the enabled boards of `conf`. Disabled boards keep their
    /// position in the list, so bus addresses match the configuration.
    pub fn new(bus: B, conf: &Conf) -> Self {
        let boards = conf
            .boards
            .iter()
            .enumerate()
            .filter(|(_, settings)| settings.enabled)
            .map(|(index, settings)| {
                let mut dc_offsets = [0u32; MAX_CHANNELS];
                for (ch, offset) in dc_offsets.iter_mut().enumerate() {
                    *offset = settings.dc_offsets.get(ch, 0x8000).min(0xFFFF);
                }
                Board {
                    index,
                    settings: settings.clone(),
                    variant: None,
                    dc_offsets,
                    downsample: settings.downsample_factors(),
                }
            })
            .collect();
        Self {
            bus,
            boards,
            readout: conf.readout.clone(),
            calibration: conf.calibration.clone(),
            run_id: conf.run.run_id,
            state: DriverState::Closed,
            expected_event_bytes: 0,
            calibrations: Vec::new(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Outcome of the last calibration, one entry per calibrated channel.
    pub fn calibrations(&self) -> &[ChannelCalibration] {
        &self.calibrations
    }

    /// Bytes of one assembled event before down-sampling.
    pub fn expected_event_bytes(&self) -> usize {
        self.expected_event_bytes
    }

    pub fn variants(&self) -> Vec<Option<DeviceVariant>> {
        self.boards.iter().map(|b| b.variant).collect()
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Open, reset and identify every enabled board.
    ///
    /// Any failure is fatal to the whole step and is reported as an
    /// initialization failure of the offending board.
    pub fn initialize_boards(&mut self) -> Result<(), DriverError> {
        self.state = DriverState::Closed;
        for i in 0..self.boards.len() {
            let index = self.boards[i].index;
            self.identify(i).map_err(|e| match e {
                DriverError::Init { .. } | DriverError::UnknownDevice { .. } => e,
                other => DriverError::Init {
                    board: index,
                    reason: other.to_string(),
                },
            })?;
        }
        self.state = DriverState::Initialized;
        Ok(())
    }

    fn identify(&mut self, i: usize) -> Result<(), DriverError> {
        let index = self.boards[i].index;
        self.bus.open(index)?;
        self.bus.write_register(index, SW_RESET, 1)?;
        let info = self.bus.read_register(index, BOARD_INFO)?;
        let variant = DeviceVariant::from_code(info).ok_or(DriverError::UnknownDevice {
            board: index,
            code: info & 0xFF,
        })?;
        let firmware = self.bus.read_register(index, ROC_FIRMWARE)?;

        let board = &mut self.boards[i];
        let constants = variant.constants();
        let record_length = board.settings.record_length;
        if record_length == 0 || record_length % 2 != 0 || record_length > constants.memory_depth {
            return Err(DriverError::Init {
                board: index,
                reason: format!(
                    "record length {} must be even and at most {}",
                    record_length, constants.memory_depth
                ),
            });
        }
        if board.settings.zle && board.downsample.iter().any(|&f| f > 1) {
            warn!(
                "Board {} uses zero-length encoding, down-sampling is ignored",
                index
            );
        }
        board.variant = Some(variant);
        info!(
            "Board {}: {:?}, {}-bit ADC, {} ns/sample, firmware 0x{:08X}",
            index, variant, constants.adc_bits, constants.clock_tick_ns, firmware
        );
        Ok(())
    }

    /// Tune the DC offset of every channel flagged for calibration.
    ///
    /// A channel that misses the tolerance or never settles is reported and
    /// left at the best offset found; only register failures are errors.
    pub fn calibrate(&mut self) -> Result<(), DriverError> {
        if self.state == DriverState::Closed {
            return Err(DriverError::NotInitialized);
        }
        self.calibrations.clear();
        for i in 0..self.boards.len() {
            let mask = self.boards[i].settings.calibrate_mask & self.boards[i].settings.channel_mask;
            if mask != 0 {
                self.calibrate_board(i, mask)?;
            }
        }
        Ok(())
    }

    fn calibrate_board(&mut self, i: usize, mask: u8) -> Result<(), DriverError> {
        let index = self.boards[i].index;
        let channels: Vec<usize> = (0..MAX_CHANNELS).filter(|ch| mask & (1 << ch) != 0).collect();
        let mut searches: Vec<OffsetSearch> = channels
            .iter()
            .map(|&ch| OffsetSearch::new(self.boards[i].dc_offsets[ch], &self.calibration))
            .collect();

        self.bus.write_register(index, ACQ_CONTROL, 0)?;
        self.bus.write_register(index, CHANNEL_CONFIG, 0)?;
        self.bus.write_register(index, CHANNEL_ENABLE_MASK, mask as u32)?;
        self.bus
            .write_register(index, CUSTOM_SIZE, self.calibration.record_length & !1)?;
        self.bus
            .write_register(index, TRIGGER_SOURCE_MASK, TRIGGER_SOURCE_SOFTWARE)?;

        while searches.iter().any(|s| s.is_active()) {
            for (slot, &ch) in channels.iter().enumerate() {
                if searches[slot].is_active() {
                    let offset = searches[slot].offset();
                    self.bus
                        .write_register(index, channel_register(CH_DC_OFFSET, ch), offset)?;
                }
            }
            for (slot, &ch) in channels.iter().enumerate() {
                if searches[slot].is_active() && !self.wait_dac_stable(index, ch)? {
                    warn!(
                        "Board {} channel {}: offset DAC did not settle, keeping offset 0x{:04X}",
                        index,
                        ch,
                        searches[slot].best().map_or(searches[slot].offset(), |b| b.0)
                    );
                    searches[slot].mark_unstable();
                }
            }
            if !searches.iter().any(|s| s.is_active()) {
                break;
            }

            let data = self.software_acquisition(index)?;
            let header = BoardHeader::parse(&data).ok_or_else(|| DriverError::Malformed {
                board: index,
                reason: "calibration event without a valid header".to_string(),
            })?;
            for (slot, ch) in header.channels().enumerate() {
                let Some(pos) = channels.iter().position(|&c| c == ch) else {
                    continue;
                };
                if !searches[pos].is_active() {
                    continue;
                }
                let Some(payload) = wire::plain_channel(&data, &header, slot) else {
                    continue;
                };
                if let Some(baseline) = mean(&wire::decode_samples(payload)) {
                    debug!(
                        "Board {} channel {}: offset 0x{:04X} gives baseline {:.1}",
                        index,
                        ch,
                        searches[pos].offset(),
                        baseline
                    );
                    searches[pos].record(baseline);
                }
            }
        }

        for (slot, &ch) in channels.iter().enumerate() {
            let search = &searches[slot];
            let (offset, baseline) = match search.best() {
                Some((offset, baseline)) => (offset, Some(baseline)),
                None => (search.offset(), None),
            };
            self.boards[i].dc_offsets[ch] = offset;
            self.bus
                .write_register(index, channel_register(CH_DC_OFFSET, ch), offset)?;
            match search.state() {
                SearchState::Converged => info!(
                    "Board {} channel {}: offset 0x{:04X}, baseline {:.1} after {} iterations",
                    index,
                    ch,
                    offset,
                    baseline.unwrap_or_default(),
                    search.iterations()
                ),
                SearchState::GaveUp => warn!(
                    "Board {} channel {}: baseline {:.1} still off target {:.1} after {} iterations, using offset 0x{:04X}",
                    index,
                    ch,
                    baseline.unwrap_or_default(),
                    self.calibration.target_baseline,
                    search.iterations(),
                    offset
                ),
                _ => {}
            }
            self.calibrations.push(ChannelCalibration {
                board: index,
                channel: ch,
                offset,
                baseline,
                iterations: search.iterations(),
                state: search.state(),
            });
        }
        self.bus.write_register(index, SW_CLEAR, 1)?;
        Ok(())
    }

    fn wait_dac_stable(&mut self, board: usize, ch: usize) -> Result<bool, DriverError> {
        let address = channel_register(CH_STATUS, ch);
        for _ in 0..self.readout.stable_retries.max(1) {
            if self.bus.read_register(board, address)? & CH_STATUS_DAC_BUSY == 0 {
                return Ok(true);
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(false)
    }

    /// Record one software-triggered event on a single board.
    fn software_acquisition(&mut self, board: usize) -> Result<Vec<u8>, DriverError> {
        self.bus.write_register(board, SW_CLEAR, 1)?;
        self.bus.write_register(board, ACQ_CONTROL, ACQ_CONTROL_RUN)?;
        self.bus.write_register(board, SW_TRIGGER, 1)?;
        let ready = self.wait_event_ready(board);
        let stopped = self.bus.write_register(board, ACQ_CONTROL, 0);
        if !ready? {
            return Err(DriverError::NotReady { board });
        }
        stopped?;
        let words = self.bus.read_register(board, EVENT_SIZE)? as usize;
        let mut data = vec![0u8; words * 4];
        let transferred = self.bus.read_event_buffer(board, &mut data)?;
        data.truncate(transferred);
        Ok(data)
    }

    fn wait_event_ready(&mut self, board: usize) -> Result<bool, DriverError> {
        for _ in 0..self.readout.ready_retries.max(1) {
            if self.bus.read_register(board, ACQ_STATUS)? & ACQ_STATUS_EVENT_READY != 0 {
                return Ok(true);
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(false)
    }

    /// Program the run configuration into every board and wait for them to
    /// report ready.
    pub fn update(&mut self) -> Result<(), DriverError> {
        if self.state == DriverState::Closed {
            return Err(DriverError::NotInitialized);
        }
        let use_interrupts = self.use_interrupts();
        self.expected_event_bytes = 0;
        for board in &self.boards {
            let index = board.index;
            let settings = &board.settings;
            let constants = board.constants().ok_or(DriverError::NotInitialized)?;

            let zle = if settings.zle { CHANNEL_CONFIG_ZLE } else { 0 };
            self.bus.write_register(index, ACQ_CONTROL, 0)?;
            self.bus.write_register(index, CHANNEL_CONFIG, zle)?;
            let buffers = (constants.memory_depth / settings.record_length).max(1);
            self.bus
                .write_register(index, BUFFER_ORGANIZATION, buffers.ilog2().min(MAX_BUFFER_CODE))?;
            self.bus.write_register(index, CUSTOM_SIZE, settings.record_length)?;
            self.bus
                .write_register(index, POST_TRIGGER, settings.post_trigger.min(100))?;
            self.bus
                .write_register(index, CHANNEL_ENABLE_MASK, settings.channel_mask as u32)?;

            for ch in (0..MAX_CHANNELS).filter(|&ch| settings.channel_enabled(ch)) {
                self.bus.write_register(
                    index,
                    channel_register(CH_TRIGGER_THRESHOLD, ch),
                    settings.thresholds.get(ch, 0),
                )?;
                if settings.zle {
                    self.bus.write_register(
                        index,
                        channel_register(CH_ZS_THRESHOLD, ch),
                        settings.zs_threshold,
                    )?;
                    self.bus.write_register(
                        index,
                        channel_register(CH_ZS_NSAMPLES, ch),
                        settings.zs_samples,
                    )?;
                }
                self.bus.write_register(
                    index,
                    channel_register(CH_DC_OFFSET, ch),
                    board.dc_offsets[ch],
                )?;
            }

            let mut trigger_source = settings.trigger_source_mask as u32
                | ((settings.coincidence_level as u32 & 0x7) << 24)
                | TRIGGER_SOURCE_SOFTWARE;
            if settings.external_trigger {
                trigger_source |= TRIGGER_SOURCE_EXTERNAL;
            }
            self.bus
                .write_register(index, TRIGGER_SOURCE_MASK, trigger_source)?;
            self.bus.write_register(
                index,
                TRIGGER_OUT_MASK,
                settings.trigger_source_mask as u32,
            )?;

            if use_interrupts {
                self.bus
                    .write_register(index, VME_CONTROL, VME_CONTROL_IRQ_LEVEL1)?;
                self.bus.write_register(index, INTERRUPT_EVENT_NUMBER, 1)?;
            } else {
                self.bus.write_register(index, VME_CONTROL, 0)?;
            }
            self.bus.write_register(index, BLT_EVENT_NUMBER, 1)?;

            self.expected_event_bytes += board.expected_event_bytes();
        }

        for board in &self.boards {
            let mut ready = false;
            for _ in 0..self.readout.ready_retries.max(1) {
                if self.bus.read_register(board.index, ACQ_STATUS)? & ACQ_STATUS_BOARD_READY != 0 {
                    ready = true;
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
            if !ready {
                return Err(DriverError::NotReady { board: board.index });
            }
        }

        let dump: Vec<(usize, u8)> = self
            .boards
            .iter()
            .map(|b| (b.index, b.settings.channel_mask))
            .collect();
        log_all(&mut self.bus, &dump);
        info!(
            "Configured {} boards, {} bytes per event",
            self.boards.len(),
            self.expected_event_bytes
        );
        self.state = DriverState::Configured;
        Ok(())
    }

    fn use_interrupts(&self) -> bool {
        self.readout.use_interrupts && self.bus.supports_interrupts()
    }

    /// Arm every board, run the trigger loop and always quiesce afterwards.
    pub fn run_loop(&mut self, sink: &EventSink) -> Result<(), DriverError> {
        if self.state != DriverState::Configured {
            return Err(DriverError::NotInitialized);
        }
        let result = self
            .arm()
            .and_then(|()| self.trigger_loop(sink));
        self.quiesce();
        result
    }

    fn arm(&mut self) -> Result<(), DriverError> {
        for board in &self.boards {
            self.bus.write_register(board.index, SW_CLEAR, 1)?;
        }
        // the first board starts last so every board sees its first trigger
        for board in self.boards.iter().rev() {
            self.bus
                .write_register(board.index, ACQ_CONTROL, ACQ_CONTROL_RUN)?;
        }
        Ok(())
    }

    fn quiesce(&mut self) {
        for board in &self.boards {
            let stopped = self
                .bus
                .write_register(board.index, ACQ_CONTROL, 0)
                .and_then(|()| self.bus.write_register(board.index, SW_CLEAR, 1));
            if let Err(e) = stopped {
                error!("Could not stop board {}: {}", board.index, e);
            }
        }
    }

    fn trigger_loop(&mut self, sink: &EventSink) -> Result<(), DriverError> {
        let Some(first) = self.boards.first().map(|b| b.index) else {
            return Ok(());
        };
        while !sink.should_stop() {
            if !self.wait_for_data(first)? {
                if self.readout.auto_trigger {
                    self.bus.write_register(first, SW_TRIGGER, 1)?;
                }
                continue;
            }
            if let Some(event) = self.read_event(sink)? {
                sink.post_event(event);
            }
        }
        Ok(())
    }

    /// Wait for a trigger. Returns false on timeout.
    fn wait_for_data(&mut self, first: usize) -> Result<bool, DriverError> {
        let timeout_ms = self.readout.interrupt_timeout_ms;
        if self.use_interrupts() {
            return match self.bus.wait_for_interrupt(first, EVENT_READY_IRQ, timeout_ms) {
                Ok(()) => Ok(true),
                Err(WaitError::Timeout) => Ok(false),
                Err(WaitError::Bus(e)) => Err(e.into()),
            };
        }
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            for board in &self.boards {
                let status = self.bus.read_register(board.index, ACQ_STATUS)?;
                if status & ACQ_STATUS_EVENT_READY != 0 {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Assemble one event from every board. Returns `None` when the run was
    /// cancelled part way through.
    fn read_event(&mut self, sink: &EventSink) -> Result<Option<RawEvent>, DriverError> {
        let mut event = RawEvent::new(true);
        event.set_run_id(self.run_id);
        let block = event.add_block(BlockType::Digitizer, self.expected_event_bytes);
        let tolerance = self.readout.size_tolerance_bytes;
        let mut offset = 0usize;
        let mut reference_counter = None;

        for i in 0..self.boards.len() {
            if sink.is_cancelled() {
                debug!("Run cancelled, abandoning event {}", event.event_id());
                return Ok(None);
            }
            let index = self.boards[i].index;
            if !self.wait_event_ready(index)? {
                return Err(DriverError::MissingSubEvent { board: index });
            }

            let declared_words = self.bus.read_register(index, EVENT_SIZE)? as usize;
            let declared = declared_words * 4;
            event.resize_block(block, offset + declared)?;
            let data = match event.get_block_mut(block) {
                Some(b) => &mut b.bytes_mut()[offset..offset + declared],
                None => return Err(BlockError::OutOfRange { index: block, count: 0 }.into()),
            };
            let transferred = self.bus.read_event_buffer(index, data)?;

            let header =
                BoardHeader::parse(&data[..transferred]).ok_or_else(|| DriverError::Malformed {
                    board: index,
                    reason: format!("no board header in {} bytes", transferred),
                })?;
            if header.size_bytes().abs_diff(transferred) > tolerance {
                return Err(DriverError::EventSizeMismatch {
                    board: index,
                    declared: header.size_bytes(),
                    transferred,
                });
            }
            match reference_counter {
                None => reference_counter = Some(header.event_counter),
                Some(expected) if expected != header.event_counter => {
                    return Err(DriverError::TriggerCounterMismatch {
                        board: index,
                        expected,
                        found: header.event_counter,
                    });
                }
                Some(_) => {}
            }

            let used = if header.zle {
                transferred
            } else {
                downsample_board(&mut data[..transferred], &self.boards[i].downsample)
                    .ok_or_else(|| DriverError::Malformed {
                        board: index,
                        reason: format!(
                            "channel data ends after {} of {} bytes",
                            transferred,
                            header.size_bytes()
                        ),
                    })?
            };
            offset += used;
        }

        event.truncate_block(block, offset)?;
        Ok(Some(event))
    }
}

fn mean(samples: &[u16]) -> Option<f64> {
    Array1::from_iter(samples.iter().map(|&s| s as f64)).mean()
}

impl<B: RegisterBus> HardwareDriver for DigitizerDriver<B> {
    fn initialize(&mut self) -> Result<(), DriverError> {
        self.initialize_boards()?;
        self.calibrate()
    }

    fn prepare_run(&mut self) -> Result<(), DriverError> {
        self.update()
    }

    fn readout(&mut self, sink: &EventSink) -> Result<(), DriverError> {
        self.run_loop(sink)
    }

    fn close(&mut self) {
        for board in &self.boards {
            self.bus.close(board.index);
        }
        self.state = DriverState::Closed;
    }
}
