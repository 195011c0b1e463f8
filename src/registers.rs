use crate::RegisterBus;
use log::info;

// Per-channel registers live at base | (channel << 8).
pub const CH_ZS_THRESHOLD: u32 = 0x1024;
pub const CH_ZS_NSAMPLES: u32 = 0x1028;
pub const CH_TRIGGER_THRESHOLD: u32 = 0x1080;
pub const CH_STATUS: u32 = 0x1088;
pub const CH_DC_OFFSET: u32 = 0x1098;

pub const CHANNEL_CONFIG: u32 = 0x8000;
pub const BUFFER_ORGANIZATION: u32 = 0x800C;
pub const CUSTOM_SIZE: u32 = 0x8020;
pub const ACQ_CONTROL: u32 = 0x8100;
pub const ACQ_STATUS: u32 = 0x8104;
pub const SW_TRIGGER: u32 = 0x8108;
pub const TRIGGER_SOURCE_MASK: u32 = 0x810C;
pub const TRIGGER_OUT_MASK: u32 = 0x8110;
pub const POST_TRIGGER: u32 = 0x8114;
pub const CHANNEL_ENABLE_MASK: u32 = 0x8120;
pub const ROC_FIRMWARE: u32 = 0x8124;
pub const EVENT_STORED: u32 = 0x812C;
pub const BOARD_INFO: u32 = 0x8140;
pub const EVENT_SIZE: u32 = 0x814C;
pub const VME_CONTROL: u32 = 0xEF00;
pub const INTERRUPT_EVENT_NUMBER: u32 = 0xEF18;
pub const BLT_EVENT_NUMBER: u32 = 0xEF1C;
pub const SW_RESET: u32 = 0xEF24;
pub const SW_CLEAR: u32 = 0xEF28;

pub const ACQ_CONTROL_RUN: u32 = 1 << 2;
pub const ACQ_STATUS_RUN: u32 = 1 << 2;
pub const ACQ_STATUS_EVENT_READY: u32 = 1 << 3;
pub const ACQ_STATUS_BOARD_READY: u32 = 1 << 8;
/// Set while the channel's offset DAC is still settling.
pub const CH_STATUS_DAC_BUSY: u32 = 1 << 2;
pub const CHANNEL_CONFIG_ZLE: u32 = 2 << 16;
pub const TRIGGER_SOURCE_SOFTWARE: u32 = 1 << 31;
pub const TRIGGER_SOURCE_EXTERNAL: u32 = 1 << 30;
pub const VME_CONTROL_IRQ_LEVEL1: u32 = 1;

pub const MAX_CHANNELS: usize = 8;

pub fn channel_register(base: u32, channel: usize) -> u32 {
    base | ((channel as u32) << 8)
}

/// Hardware-fixed properties of a supported board model.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct VariantConstants {
    pub adc_bits: u32,
    /// Samples per channel the on-board memory can hold.
    pub memory_depth: u32,
    pub clock_tick_ns: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceVariant {
    V1724,
    V1720,
    V1751,
    V1730,
}

impl DeviceVariant {
    /// Decode the model byte of the board-info register.
    pub fn from_code(code: u32) -> Option<Self> {
        match code & 0xFF {
            0x00 => Some(Self::V1724),
            0x03 => Some(Self::V1720),
            0x05 => Some(Self::V1751),
            0x08 => Some(Self::V1730),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::V1724 => 0x00,
            Self::V1720 => 0x03,
            Self::V1751 => 0x05,
            Self::V1730 => 0x08,
        }
    }

    pub fn constants(self) -> VariantConstants {
        match self {
            Self::V1724 => VariantConstants {
                adc_bits: 14,
                memory_depth: 512 * 1024,
                clock_tick_ns: 10.0,
            },
            Self::V1720 => VariantConstants {
                adc_bits: 12,
                memory_depth: 1280 * 1024,
                clock_tick_ns: 4.0,
            },
            Self::V1751 => VariantConstants {
                adc_bits: 10,
                memory_depth: 1792 * 1024,
                clock_tick_ns: 1.0,
            },
            Self::V1730 => VariantConstants {
                adc_bits: 14,
                memory_depth: 640 * 1024,
                clock_tick_ns: 2.0,
            },
        }
    }
}

const BOARD_REGISTERS: &[(&str, u32)] = &[
    ("ChannelConfig", CHANNEL_CONFIG),
    ("BufferOrganization", BUFFER_ORGANIZATION),
    ("CustomSize", CUSTOM_SIZE),
    ("AcqControl", ACQ_CONTROL),
    ("AcqStatus", ACQ_STATUS),
    ("TriggerSourceMask", TRIGGER_SOURCE_MASK),
    ("TriggerOutMask", TRIGGER_OUT_MASK),
    ("PostTrigger", POST_TRIGGER),
    ("ChannelEnableMask", CHANNEL_ENABLE_MASK),
    ("RocFirmware", ROC_FIRMWARE),
    ("EventStored", EVENT_STORED),
    ("BoardInfo", BOARD_INFO),
    ("VmeControl", VME_CONTROL),
    ("InterruptEventNumber", INTERRUPT_EVENT_NUMBER),
    ("BltEventNumber", BLT_EVENT_NUMBER),
];

/// List of channel-level registers to read back for each enabled channel.
const CHANNEL_REGISTERS: &[(&str, u32)] = &[
    ("ZsThreshold", CH_ZS_THRESHOLD),
    ("ZsNSamples", CH_ZS_NSAMPLES),
    ("TriggerThreshold", CH_TRIGGER_THRESHOLD),
    ("Status", CH_STATUS),
    ("DcOffset", CH_DC_OFFSET),
];

/// Read back every programmed register of the given boards and log them.
///
/// `boards` pairs a board index with its enabled-channel mask. Registers that
/// fail to read are skipped.
pub fn log_all<B: RegisterBus + ?Sized>(bus: &mut B, boards: &[(usize, u8)]) {
    for &(board, channel_mask) in boards {
        let mut register_log = String::new();

        for &(name, address) in BOARD_REGISTERS {
            if let Ok(value) = bus.read_register(board, address) {
                register_log.push_str(&format!("{}: 0x{:08X}\n", name, value));
            }
        }

        for &(name, base) in CHANNEL_REGISTERS {
            for ch in (0..MAX_CHANNELS).filter(|ch| channel_mask & (1 << ch) != 0) {
                match bus.read_register(board, channel_register(base, ch)) {
                    Ok(value) => {
                        register_log.push_str(&format!("{}[{}]: 0x{:08X}\n", name, ch, value));
                    }
                    Err(_) => {
                        continue;
                    }
                }
            }
        }

        if register_log.ends_with('\n') {
            register_log.pop();
        }
        info!("Digitizer {} registers:\n{}", board, register_log);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_registers_are_spaced_by_channel() {
        assert_eq!(channel_register(CH_DC_OFFSET, 0), 0x1098);
        assert_eq!(channel_register(CH_DC_OFFSET, 3), 0x1398);
        assert_eq!(channel_register(CH_STATUS, 7), 0x1788);
    }

    #[test]
    fn variant_codes_round_trip_through_the_table() {
        for variant in [
            DeviceVariant::V1724,
            DeviceVariant::V1720,
            DeviceVariant::V1751,
            DeviceVariant::V1730,
        ] {
            assert_eq!(DeviceVariant::from_code(variant.code()), Some(variant));
        }
        // upper bytes carry memory size and revision, not the model
        assert_eq!(DeviceVariant::from_code(0x0A03), Some(DeviceVariant::V1720));
        assert_eq!(DeviceVariant::from_code(0x42), None);
        assert_eq!(DeviceVariant::V1720.constants().adc_bits, 12);
    }
}
