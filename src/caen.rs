//! `Digitizer` over libCAENDigitizer.

mod ffi {
    #![allow(non_upper_case_globals)]
    #![allow(non_camel_case_types)]
    #![allow(non_snake_case)]
    #![allow(dead_code)]
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
}

use libc::{c_char, c_int};
use std::{ffi::CStr, ptr};

use crate::{
    AcqMode, BoardInfo, DgtzResult, DgtzReturn, Digitizer, Drs4Frequency, Handle, IoLevel,
    LinkSettings, TriggerMode, TriggerPolarity,
};

const SLAVE_TERMINATED_READOUT_MBLT: u32 = 0;
const ENABLE: u32 = 1;
const DISABLE: u32 = 0;

/// The real board, reached through the vendor library.
#[derive(Debug)]
pub struct CaenDigitizer {
    readout: *mut c_char,
    readout_size: u32,
}

impl Default for CaenDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl CaenDigitizer {
    pub fn new() -> Self {
        Self {
            readout: ptr::null_mut(),
            readout_size: 0,
        }
    }

    fn free_readout(&mut self) {
        if !self.readout.is_null() {
            unsafe { ffi::CAEN_DGTZ_FreeReadoutBuffer(&mut self.readout) };
            self.readout = ptr::null_mut();
            self.readout_size = 0;
        }
    }
}

impl Drop for CaenDigitizer {
    fn drop(&mut self) {
        self.free_readout();
    }
}

fn cstr(bytes: &[c_char]) -> String {
    if !bytes.contains(&0) {
        return String::new();
    }
    unsafe { CStr::from_ptr(bytes.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn trigger_mode(raw: u32) -> DgtzResult<TriggerMode> {
    TriggerMode::from_raw(raw).ok_or(DgtzReturn::Unknown)
}

impl Digitizer for CaenDigitizer {
    fn open(&mut self, link: &LinkSettings) -> DgtzResult<Handle> {
        let mut handle: c_int = 0;
        let res = unsafe {
            ffi::CAEN_DGTZ_OpenDigitizer(
                link.link_type as _,
                link.link_num,
                link.conet_node,
                link.vme_base_address,
                &mut handle,
            )
        };
        DgtzReturn::check(res as i32)?;
        Ok(handle)
    }

    fn close(&mut self, handle: Handle) -> DgtzResult<()> {
        self.free_readout();
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_CloseDigitizer(handle) } as i32)
    }

    fn reset(&mut self, handle: Handle) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_Reset(handle) } as i32)
    }

    fn get_info(&mut self, handle: Handle) -> DgtzResult<BoardInfo> {
        let mut info: ffi::CAEN_DGTZ_BoardInfo_t = unsafe { std::mem::zeroed() };
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_GetInfo(handle, &mut info) } as i32)?;
        Ok(BoardInfo {
            model_name: cstr(&info.ModelName),
            channels: info.Channels,
            adc_nbits: info.ADC_NBits,
            roc_firmware: cstr(&info.ROC_FirmwareRel),
            amc_firmware: cstr(&info.AMC_FirmwareRel),
            family_code: info.FamilyCode,
            serial_number: info.SerialNumber,
        })
    }

    fn read_register(&mut self, handle: Handle, address: u32) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_ReadRegister(handle, address, &mut value) } as i32,
        )?;
        Ok(value)
    }

    fn write_register(&mut self, handle: Handle, address: u32, value: u32) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_WriteRegister(handle, address, value) } as i32)
    }

    fn set_record_length(&mut self, handle: Handle, samples: u32) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_SetRecordLength(handle, samples) } as i32)
    }

    fn get_record_length(&mut self, handle: Handle) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_GetRecordLength(handle, &mut value) } as i32)?;
        Ok(value)
    }

    fn set_group_enable_mask(&mut self, handle: Handle, mask: u32) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_SetGroupEnableMask(handle, mask) } as i32)
    }

    fn get_group_enable_mask(&mut self, handle: Handle) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetGroupEnableMask(handle, &mut value) } as i32,
        )?;
        Ok(value)
    }

    fn set_channel_enable_mask(&mut self, handle: Handle, mask: u32) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_SetChannelEnableMask(handle, mask) } as i32)
    }

    fn get_channel_enable_mask(&mut self, handle: Handle) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetChannelEnableMask(handle, &mut value) } as i32,
        )?;
        Ok(value)
    }

    fn set_max_num_aggregates_blt(&mut self, handle: Handle, n: u32) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_SetMaxNumAggregatesBLT(handle, n) } as i32)
    }

    fn get_max_num_aggregates_blt(&mut self, handle: Handle) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetMaxNumAggregatesBLT(handle, &mut value) } as i32,
        )?;
        Ok(value)
    }

    fn set_drs4_sampling_frequency(
        &mut self,
        handle: Handle,
        freq: Drs4Frequency,
    ) -> DgtzResult<()> {
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_SetDRS4SamplingFrequency(handle, freq as u32 as _) } as i32,
        )
    }

    fn get_drs4_sampling_frequency(&mut self, handle: Handle) -> DgtzResult<Drs4Frequency> {
        let mut raw = 0;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetDRS4SamplingFrequency(handle, &mut raw) } as i32,
        )?;
        Drs4Frequency::from_raw(raw as u32).ok_or(DgtzReturn::Unknown)
    }

    fn set_fast_trigger_mode(&mut self, handle: Handle, mode: TriggerMode) -> DgtzResult<()> {
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_SetFastTriggerMode(handle, mode as u32 as _) } as i32,
        )
    }

    fn get_fast_trigger_mode(&mut self, handle: Handle) -> DgtzResult<TriggerMode> {
        let mut raw = 0;
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_GetFastTriggerMode(handle, &mut raw) } as i32)?;
        trigger_mode(raw as u32)
    }

    fn set_fast_trigger_digitizing(&mut self, handle: Handle, enable: bool) -> DgtzResult<()> {
        let flag = if enable { ENABLE } else { DISABLE };
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_SetFastTriggerDigitizing(handle, flag as _) } as i32,
        )
    }

    fn get_fast_trigger_digitizing(&mut self, handle: Handle) -> DgtzResult<bool> {
        let mut raw = 0;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetFastTriggerDigitizing(handle, &mut raw) } as i32,
        )?;
        Ok(raw as u32 == ENABLE)
    }

    fn get_sw_trigger_mode(&mut self, handle: Handle) -> DgtzResult<TriggerMode> {
        let mut raw = 0;
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_GetSWTriggerMode(handle, &mut raw) } as i32)?;
        trigger_mode(raw as u32)
    }

    fn get_ext_trigger_input_mode(&mut self, handle: Handle) -> DgtzResult<TriggerMode> {
        let mut raw = 0;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetExtTriggerInputMode(handle, &mut raw) } as i32,
        )?;
        trigger_mode(raw as u32)
    }

    fn get_run_synchronization_mode(&mut self, handle: Handle) -> DgtzResult<u32> {
        let mut raw = 0;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetRunSynchronizationMode(handle, &mut raw) } as i32,
        )?;
        Ok(raw as u32)
    }

    fn get_io_level(&mut self, handle: Handle) -> DgtzResult<IoLevel> {
        let mut raw = 0;
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_GetIOLevel(handle, &mut raw) } as i32)?;
        Ok(if raw as u32 == IoLevel::Nim as u32 {
            IoLevel::Nim
        } else {
            IoLevel::Ttl
        })
    }

    fn get_trigger_polarity(
        &mut self,
        handle: Handle,
        channel: u32,
    ) -> DgtzResult<TriggerPolarity> {
        let mut raw = 0;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetTriggerPolarity(handle, channel, &mut raw) } as i32,
        )?;
        Ok(if raw as u32 == TriggerPolarity::RisingEdge as u32 {
            TriggerPolarity::RisingEdge
        } else {
            TriggerPolarity::FallingEdge
        })
    }

    fn get_group_fast_trigger_threshold(&mut self, handle: Handle, group: u32) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(unsafe {
            ffi::CAEN_DGTZ_GetGroupFastTriggerThreshold(handle, group, &mut value)
        } as i32)?;
        Ok(value)
    }

    fn get_group_fast_trigger_dc_offset(&mut self, handle: Handle, group: u32) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(unsafe {
            ffi::CAEN_DGTZ_GetGroupFastTriggerDCOffset(handle, group, &mut value)
        } as i32)?;
        Ok(value)
    }

    fn get_post_trigger_size(&mut self, handle: Handle) -> DgtzResult<u32> {
        let mut value = 0u32;
        DgtzReturn::check(
            unsafe { ffi::CAEN_DGTZ_GetPostTriggerSize(handle, &mut value) } as i32,
        )?;
        Ok(value)
    }

    fn get_acquisition_mode(&mut self, handle: Handle) -> DgtzResult<AcqMode> {
        let mut raw = 0;
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_GetAcquisitionMode(handle, &mut raw) } as i32)?;
        Ok(match raw as u32 {
            0 => AcqMode::SwControlled,
            1 => AcqMode::SInControlled,
            _ => AcqMode::FirstTrgControlled,
        })
    }

    fn malloc_readout_buffer(&mut self, handle: Handle) -> DgtzResult<usize> {
        self.free_readout();
        let mut size = 0u32;
        DgtzReturn::check(unsafe {
            ffi::CAEN_DGTZ_MallocReadoutBuffer(handle, &mut self.readout, &mut size)
        } as i32)?;
        self.readout_size = size;
        Ok(size as usize)
    }

    fn sw_start_acquisition(&mut self, handle: Handle) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_SWStartAcquisition(handle) } as i32)
    }

    fn sw_stop_acquisition(&mut self, handle: Handle) -> DgtzResult<()> {
        DgtzReturn::check(unsafe { ffi::CAEN_DGTZ_SWStopAcquisition(handle) } as i32)
    }

    fn read_data(&mut self, handle: Handle, buffer: &mut Vec<u8>) -> DgtzResult<usize> {
        if self.readout.is_null() {
            return Err(DgtzReturn::InvalidBuffer);
        }
        let mut size = 0u32;
        DgtzReturn::check(unsafe {
            ffi::CAEN_DGTZ_ReadData(
                handle,
                SLAVE_TERMINATED_READOUT_MBLT as _,
                self.readout,
                &mut size,
            )
        } as i32)?;
        let len = (size.min(self.readout_size)) as usize;
        let data = unsafe { std::slice::from_raw_parts(self.readout as *const u8, len) };
        buffer.clear();
        buffer.extend_from_slice(data);
        Ok(len)
    }
}
