use serde::Deserialize;
use std::fmt;
use thiserror::Error;

use crate::LinkSettings;

/// Device handle as handed out by the vendor library on open.
pub type Handle = i32;

pub type DgtzResult<T> = Result<T, DgtzReturn>;

/// Return codes of the CAEN digitizer library.
#[repr(i32)]
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum DgtzReturn {
    #[error("operation completed successfully")]
    Success = 0,
    #[error("communication error")]
    CommError = -1,
    #[error("unspecified error")]
    GenericError = -2,
    #[error("invalid parameter")]
    InvalidParam = -3,
    #[error("invalid link type")]
    InvalidLinkType = -4,
    #[error("invalid device handle")]
    InvalidHandle = -5,
    #[error("maximum number of devices exceeded")]
    MaxDevicesError = -6,
    #[error("operation not allowed on this board type")]
    BadBoardType = -7,
    #[error("invalid interrupt level")]
    BadInterruptLev = -8,
    #[error("invalid event number")]
    BadEventNumber = -9,
    #[error("unable to read the registry")]
    ReadDeviceRegisterFail = -10,
    #[error("unable to write into the registry")]
    WriteDeviceRegisterFail = -11,
    #[error("invalid channel number")]
    InvalidChannelNumber = -13,
    #[error("channel is busy")]
    ChannelBusy = -14,
    #[error("invalid FPIO mode")]
    FPIOModeInvalid = -15,
    #[error("wrong acquisition mode")]
    WrongAcqMode = -16,
    #[error("function not allowed for this module")]
    FunctionNotAllowed = -17,
    #[error("communication timeout")]
    Timeout = -18,
    #[error("buffer invalid or out of memory")]
    InvalidBuffer = -19,
    #[error("event not found")]
    EventNotFound = -20,
    #[error("invalid event")]
    InvalidEvent = -21,
    #[error("out of memory")]
    OutOfMemory = -22,
    #[error("unable to calibrate the board")]
    CalibrationError = -23,
    #[error("unable to open the digitizer")]
    DigitizerNotFound = -24,
    #[error("digitizer already open")]
    DigitizerAlreadyOpen = -25,
    #[error("digitizer not ready to operate")]
    DigitizerNotReady = -26,
    #[error("digitizer has no IRQ lines configured")]
    InterruptNotConfigured = -27,
    #[error("digitizer flash memory is corrupted")]
    DigitizerMemoryCorrupted = -28,
    #[error("digitizer DPP firmware not supported")]
    DPPFirmwareNotSupported = -29,
    #[error("invalid firmware license")]
    InvalidLicense = -30,
    #[error("invalid digitizer status")]
    InvalidDigitizerStatus = -31,
    #[error("unsupported trace")]
    UnsupportedTrace = -32,
    #[error("invalid probe")]
    InvalidProbe = -33,
    #[error("unsupported base address")]
    UnsupportedBaseAddress = -34,
    #[error("function not yet implemented")]
    NotYetImplemented = -99,
    #[error("unknown error code")]
    Unknown = 1,
}

impl From<i32> for DgtzReturn {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::CommError,
            -2 => Self::GenericError,
            -3 => Self::InvalidParam,
            -4 => Self::InvalidLinkType,
            -5 => Self::InvalidHandle,
            -6 => Self::MaxDevicesError,
            -7 => Self::BadBoardType,
            -8 => Self::BadInterruptLev,
            -9 => Self::BadEventNumber,
            -10 => Self::ReadDeviceRegisterFail,
            -11 => Self::WriteDeviceRegisterFail,
            -13 => Self::InvalidChannelNumber,
            -14 => Self::ChannelBusy,
            -15 => Self::FPIOModeInvalid,
            -16 => Self::WrongAcqMode,
            -17 => Self::FunctionNotAllowed,
            -18 => Self::Timeout,
            -19 => Self::InvalidBuffer,
            -20 => Self::EventNotFound,
            -21 => Self::InvalidEvent,
            -22 => Self::OutOfMemory,
            -23 => Self::CalibrationError,
            -24 => Self::DigitizerNotFound,
            -25 => Self::DigitizerAlreadyOpen,
            -26 => Self::DigitizerNotReady,
            -27 => Self::InterruptNotConfigured,
            -28 => Self::DigitizerMemoryCorrupted,
            -29 => Self::DPPFirmwareNotSupported,
            -30 => Self::InvalidLicense,
            -31 => Self::InvalidDigitizerStatus,
            -32 => Self::UnsupportedTrace,
            -33 => Self::InvalidProbe,
            -34 => Self::UnsupportedBaseAddress,
            -99 => Self::NotYetImplemented,
            _ => Self::Unknown,
        }
    }
}

impl DgtzReturn {
    /// Vendor numeric code, as printed in the CAENDigitizer manual.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Turns a raw vendor return value into a `Result`.
    pub fn check(res: i32) -> DgtzResult<()> {
        match DgtzReturn::from(res) {
            DgtzReturn::Success => Ok(()),
            err => Err(err),
        }
    }
}

#[repr(u32)]
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerMode {
    Disabled = 0,
    AcqOnly = 1,
    ExtOutOnly = 2,
    AcqAndExtOut = 3,
}

impl TriggerMode {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Disabled),
            1 => Some(Self::AcqOnly),
            2 => Some(Self::ExtOutOnly),
            3 => Some(Self::AcqAndExtOut),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "Disabled Trigger",
            Self::AcqOnly => "Acquisition Trigger Mode Only",
            Self::ExtOutOnly => "External Out Trigger Mode Only",
            Self::AcqAndExtOut => "Acquisition Trigger Mode and External Out",
        };
        f.write_str(s)
    }
}

/// DRS4 sampling frequency.
#[repr(u32)]
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Drs4Frequency {
    #[serde(rename = "5GHz")]
    F5GHz = 0,
    #[serde(rename = "2.5GHz")]
    F2_5GHz = 1,
    #[serde(rename = "1GHz")]
    F1GHz = 2,
    #[serde(rename = "750MHz")]
    F750MHz = 3,
}

impl Drs4Frequency {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::F5GHz),
            1 => Some(Self::F2_5GHz),
            2 => Some(Self::F1GHz),
            3 => Some(Self::F750MHz),
            _ => None,
        }
    }
}

impl fmt::Display for Drs4Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F5GHz => "5 GHz",
            Self::F2_5GHz => "2.5 GHz",
            Self::F1GHz => "1.0 GHz",
            Self::F750MHz => "0.75 GHz",
        };
        f.write_str(s)
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoLevel {
    Nim = 0,
    Ttl = 1,
}

impl fmt::Display for IoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nim => f.write_str("[NIM]"),
            Self::Ttl => f.write_str("[TTL]"),
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriggerPolarity {
    RisingEdge = 0,
    FallingEdge = 1,
}

impl fmt::Display for TriggerPolarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RisingEdge => f.write_str("[On rising edge]"),
            Self::FallingEdge => f.write_str("[On falling edge]"),
        }
    }
}

#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AcqMode {
    SwControlled = 0,
    SInControlled = 1,
    FirstTrgControlled = 2,
}

impl fmt::Display for AcqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SwControlled => f.write_str("[Software controlled]"),
            Self::SInControlled => f.write_str("[S_IN controlled]"),
            Self::FirstTrgControlled => f.write_str("[First Trigger Controlled]"),
        }
    }
}

/// Board description returned by the info query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoardInfo {
    pub model_name: String,
    pub channels: u32,
    pub adc_nbits: u32,
    pub roc_firmware: String,
    pub amc_firmware: String,
    pub family_code: u32,
    pub serial_number: u32,
}

/// The subset of the CAEN digitizer library this tool talks to.
///
/// Every call is synchronous and returns the vendor code on failure. The
/// handle is owned by the caller; implementations must not cache it.
pub trait Digitizer {
    fn open(&mut self, link: &LinkSettings) -> DgtzResult<Handle>;
    fn close(&mut self, handle: Handle) -> DgtzResult<()>;
    fn reset(&mut self, handle: Handle) -> DgtzResult<()>;
    fn get_info(&mut self, handle: Handle) -> DgtzResult<BoardInfo>;

    fn read_register(&mut self, handle: Handle, address: u32) -> DgtzResult<u32>;
    fn write_register(&mut self, handle: Handle, address: u32, value: u32) -> DgtzResult<()>;

    fn set_record_length(&mut self, handle: Handle, samples: u32) -> DgtzResult<()>;
    fn get_record_length(&mut self, handle: Handle) -> DgtzResult<u32>;
    fn set_group_enable_mask(&mut self, handle: Handle, mask: u32) -> DgtzResult<()>;
    fn get_group_enable_mask(&mut self, handle: Handle) -> DgtzResult<u32>;
    fn set_channel_enable_mask(&mut self, handle: Handle, mask: u32) -> DgtzResult<()>;
    fn get_channel_enable_mask(&mut self, handle: Handle) -> DgtzResult<u32>;
    fn set_max_num_aggregates_blt(&mut self, handle: Handle, n: u32) -> DgtzResult<()>;
    fn get_max_num_aggregates_blt(&mut self, handle: Handle) -> DgtzResult<u32>;
    fn set_drs4_sampling_frequency(&mut self, handle: Handle, freq: Drs4Frequency)
        -> DgtzResult<()>;
    fn get_drs4_sampling_frequency(&mut self, handle: Handle) -> DgtzResult<Drs4Frequency>;
    fn set_fast_trigger_mode(&mut self, handle: Handle, mode: TriggerMode) -> DgtzResult<()>;
    fn get_fast_trigger_mode(&mut self, handle: Handle) -> DgtzResult<TriggerMode>;
    fn set_fast_trigger_digitizing(&mut self, handle: Handle, enable: bool) -> DgtzResult<()>;
    fn get_fast_trigger_digitizing(&mut self, handle: Handle) -> DgtzResult<bool>;

    fn get_sw_trigger_mode(&mut self, handle: Handle) -> DgtzResult<TriggerMode>;
    fn get_ext_trigger_input_mode(&mut self, handle: Handle) -> DgtzResult<TriggerMode>;
    fn get_run_synchronization_mode(&mut self, handle: Handle) -> DgtzResult<u32>;
    fn get_io_level(&mut self, handle: Handle) -> DgtzResult<IoLevel>;
    fn get_trigger_polarity(&mut self, handle: Handle, channel: u32)
        -> DgtzResult<TriggerPolarity>;
    fn get_group_fast_trigger_threshold(&mut self, handle: Handle, group: u32)
        -> DgtzResult<u32>;
    fn get_group_fast_trigger_dc_offset(&mut self, handle: Handle, group: u32)
        -> DgtzResult<u32>;
    fn get_post_trigger_size(&mut self, handle: Handle) -> DgtzResult<u32>;
    fn get_acquisition_mode(&mut self, handle: Handle) -> DgtzResult<AcqMode>;

    /// Allocates the readout buffer used by `read_data`, returning its size in bytes.
    fn malloc_readout_buffer(&mut self, handle: Handle) -> DgtzResult<usize>;
    fn sw_start_acquisition(&mut self, handle: Handle) -> DgtzResult<()>;
    fn sw_stop_acquisition(&mut self, handle: Handle) -> DgtzResult<()>;
    /// Blocking slave-terminated MBLT readout. `buffer` is cleared and refilled
    /// with the raw bytes of the transfer; the byte count is returned.
    fn read_data(&mut self, handle: Handle, buffer: &mut Vec<u8>) -> DgtzResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_map_to_unknown() {
        assert_eq!(DgtzReturn::from(-12), DgtzReturn::Unknown);
        assert_eq!(DgtzReturn::from(42), DgtzReturn::Unknown);
        assert_eq!(DgtzReturn::from(-99), DgtzReturn::NotYetImplemented);
    }

    #[test]
    fn check_splits_success_from_failure() {
        assert_eq!(DgtzReturn::check(0), Ok(()));
        assert_eq!(DgtzReturn::check(-1), Err(DgtzReturn::CommError));
        assert_eq!(DgtzReturn::CommError.code(), -1);
        assert_eq!(DgtzReturn::CommError.to_string(), "communication error");
    }

    #[test]
    fn raw_enum_values_round_trip() {
        for raw in 0..4 {
            assert_eq!(TriggerMode::from_raw(raw).map(|m| m as u32), Some(raw));
            assert_eq!(Drs4Frequency::from_raw(raw).map(|f| f as u32), Some(raw));
        }
        assert_eq!(TriggerMode::from_raw(7), None);
        assert_eq!(Drs4Frequency::from_raw(4), None);
    }
}
