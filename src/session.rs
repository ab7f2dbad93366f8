use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use std::{
    fmt::Display,
    fs::File,
    io::BufWriter,
    thread,
};
use thiserror::Error;

use crate::{
    registers::{
        self, GroupRegisters, FRONT_PANEL_IO_CTRL, GLOBAL_TRIGGER_MASK, GROUPS, TR0_DC_OFFSET,
        TR0_THRESHOLD,
    },
    AcqSettings, AcqSummary, Acquisition, BoardInfo, Clock, Conf, DgtzResult, DgtzReturn,
    Digitizer, Handle, MonotonicClock, OffsetError,
};

/// A vendor call that failed without stopping the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallFailure {
    pub call: &'static str,
    pub code: DgtzReturn,
}

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
    /// Nothing can work without a handle.
    #[error("could not open digitizer: {0} ({})", .0.code())]
    Open(DgtzReturn),
    /// The board info query failed and the session was closed.
    #[error("could not query board info: {0} ({})", .0.code())]
    Info(DgtzReturn),
}

/// An open DT5742 and the state that goes with it.
pub struct Dt5742<D: Digitizer, C: Clock = MonotonicClock> {
    dgtz: D,
    clock: C,
    conf: Conf,
    handle: Handle,
    is_connected: bool,
    board_info: Option<BoardInfo>,
    failures: Vec<CallFailure>,
}

impl<D: Digitizer> Dt5742<D> {
    pub fn new(dgtz: D, conf: Conf) -> Self {
        Self::with_clock(dgtz, conf, MonotonicClock)
    }
}

impl<D: Digitizer, C: Clock> Dt5742<D, C> {
    pub fn with_clock(dgtz: D, conf: Conf, clock: C) -> Self {
        Self {
            dgtz,
            clock,
            conf,
            handle: 0,
            is_connected: false,
            board_info: None,
            failures: Vec::new(),
        }
    }

    pub fn dgtz(&self) -> &D {
        &self.dgtz
    }

    pub fn dgtz_mut(&mut self) -> &mut D {
        &mut self.dgtz
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn board_info(&self) -> Option<&BoardInfo> {
        self.board_info.as_ref()
    }

    /// Every recoverable vendor failure seen so far, oldest first.
    pub fn failures(&self) -> &[CallFailure] {
        &self.failures
    }

    pub fn last_error(&self) -> Option<DgtzReturn> {
        self.failures.last().map(|f| f.code)
    }

    fn record<T>(&mut self, call: &'static str, res: DgtzResult<T>) -> Option<T> {
        match res {
            Ok(value) => Some(value),
            Err(code) => {
                warn!("{call} failed: {code} ({})", code.code());
                self.failures.push(CallFailure { call, code });
                None
            }
        }
    }

    fn show<T: Display>(&mut self, call: &'static str, res: DgtzResult<T>) -> String {
        match self.record(call, res) {
            Some(value) => value.to_string(),
            None => "<error>".to_string(),
        }
    }

    /// Opens the board, resets it and applies the configured profile, then
    /// logs the full configuration.
    ///
    /// Only a failed open is fatal. Each configuration call is checked and a
    /// failure is logged and recorded before moving on to the next one.
    pub fn init(&mut self) -> Result<(), InitError> {
        info!("Init() ...");
        let handle = match self.dgtz.open(&self.conf.link) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Could not open digitizer: {e} ({})", e.code());
                return Err(InitError::Open(e));
            }
        };
        self.handle = handle;
        self.is_connected = true;
        info!("Digitizer open, handle {handle}");

        let res = self.dgtz.reset(handle);
        self.record("Reset", res);
        thread::sleep(self.conf.settle_time());

        let board = self.conf.board_settings.clone();
        let res = self.dgtz.set_record_length(handle, board.record_len);
        self.record("SetRecordLength", res);
        let res = self.dgtz.set_group_enable_mask(handle, board.group_enable_mask);
        self.record("SetGroupEnableMask", res);
        let res = self
            .dgtz
            .set_channel_enable_mask(handle, board.channel_enable_mask);
        self.record("SetChannelEnableMask", res);
        let res = self
            .dgtz
            .set_max_num_aggregates_blt(handle, board.max_aggregates_blt);
        self.record("SetMaxNumAggregatesBLT", res);
        let res = self
            .dgtz
            .set_drs4_sampling_frequency(handle, board.drs4_frequency);
        self.record("SetDRS4SamplingFrequency", res);
        let res = self
            .dgtz
            .set_fast_trigger_mode(handle, board.fast_trigger_mode);
        self.record("SetFastTriggerMode", res);
        let res = self
            .dgtz
            .set_fast_trigger_digitizing(handle, board.fast_trigger_digitizing);
        self.record("SetFastTriggerDigitizing", res);

        let res = self
            .dgtz
            .write_register(handle, FRONT_PANEL_IO_CTRL, board.front_panel_io);
        self.record("WriteRegister(FrontPanelIO)", res);
        for (group, word) in (0..GROUPS).zip(board.group_dc_offset) {
            if let Some(regs) = GroupRegisters::of(group) {
                let res = self.dgtz.write_register(handle, regs.dc_offset, word);
                self.record("WriteRegister(GroupDCOffset)", res);
            }
        }

        self.print_info().map_err(InitError::Info)
    }

    /// Releases the handle. Calling it twice calls the vendor release twice.
    pub fn close(&mut self) -> DgtzResult<()> {
        let res = self.dgtz.close(self.handle);
        self.is_connected = false;
        if let Err(e) = res {
            error!("Could not close digitizer: {e} ({})", e.code());
            self.failures.push(CallFailure {
                call: "CloseDigitizer",
                code: e,
            });
        }
        res
    }

    /// Logs the board description and every acquisition parameter this tool
    /// sets or depends on.
    ///
    /// If the board info cannot be read the session is closed and nothing else
    /// is printed.
    pub fn print_info(&mut self) -> DgtzResult<()> {
        let h = self.handle;
        let info = match self.dgtz.get_info(h) {
            Ok(info) => info,
            Err(e) => {
                error!("Could not get board info: {e} ({})", e.code());
                self.failures.push(CallFailure {
                    call: "GetInfo",
                    code: e,
                });
                // The close failure, if any, is already logged and recorded.
                let _ = self.close();
                return Err(e);
            }
        };

        let mut log = String::new();
        log.push_str("=== COMMUNICATION ===\n");
        log.push_str(&format!("Model: {}\n", info.model_name));
        log.push_str(&format!("Channels: {}\n", info.channels));
        log.push_str(&format!("ADC_NBits: {}\n", info.adc_nbits));
        log.push_str(&format!("ROC FPGA: {}\n", info.roc_firmware));
        log.push_str(&format!("AMC FPGA: {}\n", info.amc_firmware));
        log.push_str(&format!("Board Family: {}\n", info.family_code));
        log.push_str(&format!("Serial Number: {}\n", info.serial_number));
        self.board_info = Some(info);

        log.push_str("=== TRIGGER ===\n");
        let res = self.dgtz.get_sw_trigger_mode(h);
        let v = self.show("GetSWTriggerMode", res);
        log.push_str(&format!("Software Trigger Mode: {v}\n"));
        let res = self.dgtz.get_ext_trigger_input_mode(h);
        let v = self.show("GetExtTriggerInputMode", res);
        log.push_str(&format!("External Trigger Mode: {v}\n"));
        let res = self.dgtz.get_run_synchronization_mode(h);
        let v = self.show("GetRunSynchronizationMode", res);
        log.push_str(&format!("Run synchronization mode: {v}\n"));
        let res = self.dgtz.get_io_level(h);
        let v = self.show("GetIOLevel", res);
        log.push_str(&format!("IO Level: {v}\n"));
        let res = self.dgtz.get_trigger_polarity(h, 0);
        let v = self.show("GetTriggerPolarity", res);
        log.push_str(&format!("Trigger Polarity: {v}\n"));
        for group in 0..GROUPS as u32 {
            let res = self.dgtz.get_group_fast_trigger_threshold(h, group);
            let v = self.show("GetGroupFastTriggerThreshold", res);
            log.push_str(&format!("Trig Thresh Group {group}: {v}\n"));
        }
        for group in 0..GROUPS as u32 {
            let res = self.dgtz.get_group_fast_trigger_dc_offset(h, group);
            let v = self.show("GetGroupFastTriggerDCOffset", res);
            log.push_str(&format!("Fast Trig DC Offset Group {group}: {v}\n"));
        }
        let res = self
            .dgtz
            .get_fast_trigger_digitizing(h)
            .map(|on| if on { "[Enabled]" } else { "[Disabled]" });
        let v = self.show("GetFastTriggerDigitizing", res);
        log.push_str(&format!("Fast trigger digitizing: {v}\n"));
        let res = self.dgtz.get_fast_trigger_mode(h);
        let v = self.show("GetFastTriggerMode", res);
        log.push_str(&format!("Fast trigger: {v}\n"));
        let res = self.dgtz.get_drs4_sampling_frequency(h);
        let v = self.show("GetDRS4SamplingFrequency", res);
        log.push_str(&format!("DRS4 Sampling Frequency: {v}\n"));

        log.push_str("=== ACQUISITION ===\n");
        let res = self.dgtz.get_group_enable_mask(h).map(|m| format!("{m:#x}"));
        let v = self.show("GetGroupEnableMask", res);
        log.push_str(&format!("Group Enable Mask: {v}\n"));
        let res = self.dgtz.get_channel_enable_mask(h).map(|m| format!("{m:#x}"));
        let v = self.show("GetChannelEnableMask", res);
        log.push_str(&format!("Channel Enable Mask: {v}\n"));
        let res = self.dgtz.get_record_length(h);
        let v = self.show("GetRecordLength", res);
        log.push_str(&format!("Record Length: {v}\n"));
        let res = self.dgtz.get_post_trigger_size(h);
        let v = self.show("GetPostTriggerSize", res);
        log.push_str(&format!("Post Trigger Size: {v}\n"));
        let res = self.dgtz.get_acquisition_mode(h);
        let v = self.show("GetAcquisitionMode", res);
        log.push_str(&format!("Acquisition Mode: {v}\n"));

        log.push_str("====================\n");
        let res = self.dgtz.read_register(h, GLOBAL_TRIGGER_MASK);
        if let Some(reg) = self.record("ReadRegister(GlobalTriggerMask)", res) {
            log.push_str(&format!("Global Trigger Mask => Reg {GLOBAL_TRIGGER_MASK:#X}:\n"));
            log.push_str(&format!(" ex_trig: {}\n", (reg >> 30) & 1));
            log.push_str(&format!(" sw_trig: {}\n", (reg >> 31) & 1));
        }
        let res = self.dgtz.read_register(h, FRONT_PANEL_IO_CTRL);
        if let Some(reg) = self.record("ReadRegister(FrontPanelIO)", res) {
            log.push_str(&format!(
                "Front Panel IO Control => Reg {FRONT_PANEL_IO_CTRL:#X}: {reg:#x}\n"
            ));
            for bit in 16..20 {
                log.push_str(&format!(" bit{bit}: {}\n", (reg >> bit) & 1));
            }
            log.push_str(&format!(" bit20 (busy out): {}\n", (reg >> 20) & 1));
        }

        log.push_str("CH-wise configuration:\n");
        for channel in 0..registers::CHANNELS_PER_GROUP {
            let mut line = String::new();
            for group in 0..GROUPS {
                let Some(regs) = GroupRegisters::of(group) else {
                    continue;
                };
                let res = self
                    .dgtz
                    .write_register(h, regs.channel_select, channel as u32);
                self.record("WriteRegister(ChannelSelect)", res);
                let res = self.dgtz.read_register(h, regs.threshold);
                let thr = self.show("ReadRegister(ChannelThreshold)", res);
                let res = self.dgtz.read_register(h, regs.dc_offset);
                let offset = self.show("ReadRegister(ChannelDCOffset)", res);
                let index = group as u32 * registers::CHANNELS_PER_GROUP as u32 + channel as u32;
                line.push_str(&format!(
                    " channel {index} => thr {thr}  adc offset {offset} ||"
                ));
            }
            log.push_str(line.trim_end_matches(" ||"));
            log.push('\n');
        }

        log.push_str("TR-wise configuration:\n");
        let res = self.dgtz.read_register(h, TR0_THRESHOLD);
        let thr = self.show("ReadRegister(TR0Threshold)", res);
        let res = self.dgtz.read_register(h, TR0_DC_OFFSET);
        let offset = self.show("ReadRegister(TR0DCOffset)", res);
        log.push_str(&format!(" tr0  => thr {thr}  adc offset {offset}\n"));

        let res = self.dgtz.get_max_num_aggregates_blt(h);
        let v = self.show("GetMaxNumAggregatesBLT", res);
        log.push_str(&format!("MaxAggregatesBLT: {v}"));

        info!("Digitizer parameters:\n{}", log);
        Ok(())
    }

    /// Reads back the DC offset of one channel.
    pub fn channel_offset(&mut self, group: u8, channel: u8) -> Result<u16, OffsetError> {
        registers::channel_offset(&mut self.dgtz, self.handle, group, channel)
    }

    /// Sets the DC offset of one channel, refusing while the group is busy.
    pub fn write_dc_offset(&mut self, group: u8, channel: u8, offset: u32) -> Result<(), OffsetError> {
        registers::write_dc_offset(&mut self.dgtz, self.handle, group, channel, offset)
    }

    /// Acquires at least `target` events into the configured output file,
    /// which is truncated first.
    pub fn read(&mut self, target: usize) -> Result<AcqSummary> {
        if !self.is_connected {
            bail!("digitizer is not open");
        }
        let path = &self.conf.run_settings.output_file;
        let file =
            File::create(path).with_context(|| format!("could not create output file {path}"))?;
        let mut sink = BufWriter::new(file);

        let settings = AcqSettings {
            target_events: target,
            ..AcqSettings::from_conf(&self.conf)
        };
        info!("Start acquisition: aim {target} events into {path}");
        let summary =
            Acquisition::new(&mut self.dgtz, self.handle, &self.clock, settings).run(&mut sink)?;
        info!(
            "Acquisition ran from {} to {} ({:.1} s)",
            summary.started_at,
            summary.stopped_at,
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }
}
