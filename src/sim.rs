//! In-memory DT5742 used for tests and for `--simulate` runs.
//!
//! The simulator records every call made through the `Digitizer` trait,
//! models the per-group channel-select / DC offset latches, and answers the
//! acquisition status register from either a fixed script or a seeded spill
//! generator. Every status read advances the shared `SimClock`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    registers::{GroupRegisters, ACQ_STATUS, CHANNELS_PER_GROUP, GROUPS, GROUP_BUSY},
    AcqMode, AcqStatus, BoardInfo, DgtzResult, DgtzReturn, Digitizer, Drs4Frequency, Handle,
    IoLevel, LinkSettings, SimClock, TriggerMode, TriggerPolarity,
};

/// One answer of the acquisition status register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimPoll {
    pub status: DgtzResult<u32>,
    /// Simulated time spent in this poll.
    pub advance: Duration,
}

impl SimPoll {
    pub fn idle(advance: Duration) -> Self {
        Self {
            status: Ok(AcqStatus::RUNNING),
            advance,
        }
    }

    pub fn ready(advance: Duration) -> Self {
        Self {
            status: Ok(AcqStatus::RUNNING | AcqStatus::EVENT_READY),
            advance,
        }
    }

    pub fn failed(code: DgtzReturn, advance: Duration) -> Self {
        Self {
            status: Err(code),
            advance,
        }
    }

    pub fn buffer_full(mut self) -> Self {
        if let Ok(status) = self.status.as_mut() {
            *status |= AcqStatus::BUFFER_FULL;
        }
        self
    }
}

/// Periodic spills with random triggers inside each spill.
#[derive(Clone, Debug)]
pub struct SpillPattern {
    pub poll_period: Duration,
    pub spill_length: Duration,
    pub spill_gap: Duration,
    /// Probability that a poll inside a spill finds an event ready.
    pub trigger_probability: f64,
}

impl Default for SpillPattern {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_micros(20),
            spill_length: Duration::from_secs(4),
            spill_gap: Duration::from_secs(8),
            trigger_probability: 0.05,
        }
    }
}

#[derive(Debug)]
enum StatusSource {
    Script {
        polls: VecDeque<SimPoll>,
        after: SimPoll,
    },
    Spills {
        pattern: SpillPattern,
        rng: StdRng,
    },
}

/// A call issued through the `Digitizer` trait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimCall {
    Open,
    Close(Handle),
    Reset,
    GetInfo,
    ReadRegister(u32),
    WriteRegister(u32, u32),
    SetParam(&'static str, u32),
    GetParam(&'static str),
    MallocReadoutBuffer,
    Start,
    Stop,
    ReadData,
}

impl SimCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close(_) => "close",
            Self::Reset => "reset",
            Self::GetInfo => "get_info",
            Self::ReadRegister(_) => "read_register",
            Self::WriteRegister(..) => "write_register",
            Self::SetParam(name, _) | Self::GetParam(name) => *name,
            Self::MallocReadoutBuffer => "malloc_readout_buffer",
            Self::Start => "sw_start_acquisition",
            Self::Stop => "sw_stop_acquisition",
            Self::ReadData => "read_data",
        }
    }
}

/// Acquisition parameters held by the simulated board.
#[derive(Clone, Debug, PartialEq)]
pub struct SimParams {
    pub record_length: u32,
    pub group_enable_mask: u32,
    pub channel_enable_mask: u32,
    pub max_aggregates_blt: u32,
    pub drs4_frequency: Drs4Frequency,
    pub fast_trigger_mode: TriggerMode,
    pub fast_trigger_digitizing: bool,
    pub sw_trigger_mode: TriggerMode,
    pub ext_trigger_mode: TriggerMode,
    pub run_sync_mode: u32,
    pub io_level: IoLevel,
    pub trigger_polarity: TriggerPolarity,
    pub fast_trigger_threshold: [u32; 2],
    pub fast_trigger_dc_offset: [u32; 2],
    pub post_trigger_size: u32,
    pub acq_mode: AcqMode,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            record_length: 1024,
            group_enable_mask: 0,
            channel_enable_mask: 0,
            max_aggregates_blt: 1023,
            drs4_frequency: Drs4Frequency::F5GHz,
            fast_trigger_mode: TriggerMode::Disabled,
            fast_trigger_digitizing: false,
            sw_trigger_mode: TriggerMode::AcqOnly,
            ext_trigger_mode: TriggerMode::AcqOnly,
            run_sync_mode: 0,
            io_level: IoLevel::Nim,
            trigger_polarity: TriggerPolarity::RisingEdge,
            fast_trigger_threshold: [0; 2],
            fast_trigger_dc_offset: [0; 2],
            post_trigger_size: 0,
            acq_mode: AcqMode::SwControlled,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct GroupLatch {
    selected: u8,
    busy: bool,
    offsets: [u16; CHANNELS_PER_GROUP as usize],
    thresholds: [u16; CHANNELS_PER_GROUP as usize],
}

#[derive(Debug)]
pub struct SimDigitizer {
    clock: SimClock,
    status: StatusSource,
    frames: VecDeque<Vec<u8>>,
    frame_len: usize,
    frames_read: usize,
    registers: HashMap<u32, u32>,
    groups: [GroupLatch; GROUPS as usize],
    params: SimParams,
    info: BoardInfo,
    calls: Vec<SimCall>,
    failures: HashMap<&'static str, DgtzReturn>,
    register_failures: HashMap<u32, DgtzReturn>,
    next_handle: Handle,
    open: bool,
    running: bool,
}

impl Default for SimDigitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDigitizer {
    /// A board that is never ready; each status read takes 10 ms.
    pub fn new() -> Self {
        Self {
            clock: SimClock::new(),
            status: StatusSource::Script {
                polls: VecDeque::new(),
                after: SimPoll::idle(Duration::from_millis(10)),
            },
            frames: VecDeque::new(),
            frame_len: 16,
            frames_read: 0,
            registers: HashMap::new(),
            groups: [GroupLatch::default(); GROUPS as usize],
            params: SimParams::default(),
            info: BoardInfo {
                model_name: "DT5742".to_string(),
                channels: 16,
                adc_nbits: 12,
                roc_firmware: "04.25 - Build 2101".to_string(),
                amc_firmware: "01.09 - Build 2101".to_string(),
                family_code: 6,
                serial_number: 1742,
            },
            calls: Vec::new(),
            failures: HashMap::new(),
            register_failures: HashMap::new(),
            next_handle: 0,
            open: false,
            running: false,
        }
    }

    /// A board answering `polls` in order, then `after` forever.
    pub fn scripted(polls: impl IntoIterator<Item = SimPoll>, after: SimPoll) -> Self {
        Self {
            status: StatusSource::Script {
                polls: polls.into_iter().collect(),
                after,
            },
            ..Self::new()
        }
    }

    /// A board producing random triggers grouped in periodic spills.
    pub fn with_spills(pattern: SpillPattern, seed: u64) -> Self {
        Self {
            status: StatusSource::Spills {
                pattern,
                rng: StdRng::seed_from_u64(seed),
            },
            ..Self::new()
        }
    }

    /// The clock advanced by status reads. Hand a clone to the acquisition loop.
    pub fn clock(&self) -> SimClock {
        self.clock.clone()
    }

    /// Queues a frame returned by the next `read_data`. Once the queue is empty
    /// frames are generated, each starting with its little-endian index.
    pub fn push_frame(&mut self, frame: impl Into<Vec<u8>>) {
        self.frames.push_back(frame.into());
    }

    pub fn set_frame_len(&mut self, len: usize) {
        self.frame_len = len.max(4);
    }

    pub fn set_info(&mut self, info: BoardInfo) {
        self.info = info;
    }

    /// Groups and channels the board does not have are ignored.
    pub fn set_group_busy(&mut self, group: u8, busy: bool) {
        if let Some(latch) = self.groups.get_mut(group as usize) {
            latch.busy = busy;
        }
    }

    pub fn set_channel_offset(&mut self, group: u8, channel: u8, offset: u16) {
        if let Some(slot) = self
            .groups
            .get_mut(group as usize)
            .and_then(|latch| latch.offsets.get_mut(channel as usize))
        {
            *slot = offset;
        }
    }

    pub fn set_channel_threshold(&mut self, group: u8, channel: u8, threshold: u16) {
        if let Some(slot) = self
            .groups
            .get_mut(group as usize)
            .and_then(|latch| latch.thresholds.get_mut(channel as usize))
        {
            *slot = threshold;
        }
    }

    /// Makes every call named `name` (see `SimCall::name`) fail with `code`.
    pub fn fail(&mut self, name: &'static str, code: DgtzReturn) {
        self.failures.insert(name, code);
    }

    /// Makes reads and writes of `address` fail with `code`.
    pub fn fail_register(&mut self, address: u32, code: DgtzReturn) {
        self.register_failures.insert(address, code);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
        self.register_failures.clear();
    }

    pub fn calls(&self) -> &[SimCall] {
        &self.calls
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.calls.iter().filter(|c| c.name() == name).count()
    }

    /// Last raw value written to `address`.
    pub fn register(&self, address: u32) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn params(&self) -> &SimParams {
        &self.params
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn call(&mut self, call: SimCall) -> DgtzResult<()> {
        let name = call.name();
        let register = match call {
            SimCall::ReadRegister(address) | SimCall::WriteRegister(address, _) => Some(address),
            _ => None,
        };
        self.calls.push(call);
        if let Some(code) = register.and_then(|a| self.register_failures.get(&a)) {
            return Err(*code);
        }
        match self.failures.get(name) {
            Some(code) => Err(*code),
            None => Ok(()),
        }
    }

    fn set(&mut self, name: &'static str, value: u32) -> DgtzResult<()> {
        self.call(SimCall::SetParam(name, value))
    }

    fn get(&mut self, name: &'static str) -> DgtzResult<()> {
        self.call(SimCall::GetParam(name))
    }

    fn group_of(address: u32) -> Option<(usize, GroupRegisters)> {
        (0..GROUPS).find_map(|g| {
            let regs = GroupRegisters::of(g)?;
            [regs.threshold, regs.status, regs.dc_offset, regs.channel_select]
                .contains(&address)
                .then_some((g as usize, regs))
        })
    }

    fn next_poll(&mut self) -> SimPoll {
        match &mut self.status {
            StatusSource::Script { polls, after } => {
                polls.pop_front().unwrap_or_else(|| after.clone())
            }
            StatusSource::Spills { pattern, rng } => {
                let cycle = pattern.spill_length + pattern.spill_gap;
                let phase = self.clock.elapsed().as_nanos() % cycle.as_nanos().max(1);
                let in_spill = phase < pattern.spill_length.as_nanos();
                if in_spill && rng.random_bool(pattern.trigger_probability) {
                    SimPoll::ready(pattern.poll_period)
                } else {
                    SimPoll::idle(pattern.poll_period)
                }
            }
        }
    }

    fn read_status(&mut self) -> DgtzResult<u32> {
        let poll = self.next_poll();
        self.clock.advance(poll.advance);
        let running = if self.running { AcqStatus::RUNNING } else { 0 };
        poll.status.map(|s| (s & !AcqStatus::RUNNING) | running)
    }

    fn next_frame(&mut self) -> Vec<u8> {
        let index = self.frames_read as u32;
        self.frames_read += 1;
        self.frames.pop_front().unwrap_or_else(|| {
            let mut frame = vec![0u8; self.frame_len];
            frame[..4].copy_from_slice(&index.to_le_bytes());
            frame
        })
    }
}

impl Digitizer for SimDigitizer {
    fn open(&mut self, _link: &LinkSettings) -> DgtzResult<Handle> {
        self.call(SimCall::Open)?;
        self.open = true;
        Ok(self.next_handle)
    }

    fn close(&mut self, handle: Handle) -> DgtzResult<()> {
        self.call(SimCall::Close(handle))?;
        if !self.open || handle != self.next_handle {
            return Err(DgtzReturn::InvalidHandle);
        }
        self.open = false;
        self.running = false;
        self.next_handle += 1;
        Ok(())
    }

    fn reset(&mut self, _handle: Handle) -> DgtzResult<()> {
        self.call(SimCall::Reset)?;
        self.params = SimParams::default();
        self.running = false;
        Ok(())
    }

    fn get_info(&mut self, _handle: Handle) -> DgtzResult<BoardInfo> {
        self.call(SimCall::GetInfo)?;
        Ok(self.info.clone())
    }

    fn read_register(&mut self, _handle: Handle, address: u32) -> DgtzResult<u32> {
        self.call(SimCall::ReadRegister(address))?;
        if address == ACQ_STATUS {
            return self.read_status();
        }
        let value = match Self::group_of(address) {
            Some((g, regs)) => {
                let latch = &self.groups[g];
                let ch = latch.selected as usize;
                if address == regs.status {
                    if latch.busy {
                        GROUP_BUSY
                    } else {
                        0
                    }
                } else if address == regs.dc_offset {
                    ((ch as u32) << 16) | latch.offsets[ch] as u32
                } else if address == regs.threshold {
                    latch.thresholds[ch] as u32
                } else {
                    ch as u32
                }
            }
            None => self.register(address),
        };
        Ok(value)
    }

    fn write_register(&mut self, _handle: Handle, address: u32, value: u32) -> DgtzResult<()> {
        self.call(SimCall::WriteRegister(address, value))?;
        self.registers.insert(address, value);
        if let Some((g, regs)) = Self::group_of(address) {
            let latch = &mut self.groups[g];
            if address == regs.channel_select {
                latch.selected = (value & 0x7) as u8;
            } else if address == regs.dc_offset {
                // Channel field past the last channel addresses the whole group.
                let ch = ((value >> 16) & 0xF) as usize;
                let offset = (value & 0xFFFF) as u16;
                if ch < CHANNELS_PER_GROUP as usize {
                    latch.offsets[ch] = offset;
                } else {
                    latch.offsets = [offset; CHANNELS_PER_GROUP as usize];
                }
            }
        }
        Ok(())
    }

    fn set_record_length(&mut self, _handle: Handle, samples: u32) -> DgtzResult<()> {
        self.set("set_record_length", samples)?;
        self.params.record_length = samples;
        Ok(())
    }

    fn get_record_length(&mut self, _handle: Handle) -> DgtzResult<u32> {
        self.get("get_record_length")?;
        Ok(self.params.record_length)
    }

    fn set_group_enable_mask(&mut self, _handle: Handle, mask: u32) -> DgtzResult<()> {
        self.set("set_group_enable_mask", mask)?;
        self.params.group_enable_mask = mask;
        Ok(())
    }

    fn get_group_enable_mask(&mut self, _handle: Handle) -> DgtzResult<u32> {
        self.get("get_group_enable_mask")?;
        Ok(self.params.group_enable_mask)
    }

    fn set_channel_enable_mask(&mut self, _handle: Handle, mask: u32) -> DgtzResult<()> {
        self.set("set_channel_enable_mask", mask)?;
        self.params.channel_enable_mask = mask;
        Ok(())
    }

    fn get_channel_enable_mask(&mut self, _handle: Handle) -> DgtzResult<u32> {
        self.get("get_channel_enable_mask")?;
        Ok(self.params.channel_enable_mask)
    }

    fn set_max_num_aggregates_blt(&mut self, _handle: Handle, n: u32) -> DgtzResult<()> {
        self.set("set_max_num_aggregates_blt", n)?;
        self.params.max_aggregates_blt = n;
        Ok(())
    }

    fn get_max_num_aggregates_blt(&mut self, _handle: Handle) -> DgtzResult<u32> {
        self.get("get_max_num_aggregates_blt")?;
        Ok(self.params.max_aggregates_blt)
    }

    fn set_drs4_sampling_frequency(
        &mut self,
        _handle: Handle,
        freq: Drs4Frequency,
    ) -> DgtzResult<()> {
        self.set("set_drs4_sampling_frequency", freq as u32)?;
        self.params.drs4_frequency = freq;
        Ok(())
    }

    fn get_drs4_sampling_frequency(&mut self, _handle: Handle) -> DgtzResult<Drs4Frequency> {
        self.get("get_drs4_sampling_frequency")?;
        Ok(self.params.drs4_frequency)
    }

    fn set_fast_trigger_mode(&mut self, _handle: Handle, mode: TriggerMode) -> DgtzResult<()> {
        self.set("set_fast_trigger_mode", mode as u32)?;
        self.params.fast_trigger_mode = mode;
        Ok(())
    }

    fn get_fast_trigger_mode(&mut self, _handle: Handle) -> DgtzResult<TriggerMode> {
        self.get("get_fast_trigger_mode")?;
        Ok(self.params.fast_trigger_mode)
    }

    fn set_fast_trigger_digitizing(&mut self, _handle: Handle, enable: bool) -> DgtzResult<()> {
        self.set("set_fast_trigger_digitizing", enable as u32)?;
        self.params.fast_trigger_digitizing = enable;
        Ok(())
    }

    fn get_fast_trigger_digitizing(&mut self, _handle: Handle) -> DgtzResult<bool> {
        self.get("get_fast_trigger_digitizing")?;
        Ok(self.params.fast_trigger_digitizing)
    }

    fn get_sw_trigger_mode(&mut self, _handle: Handle) -> DgtzResult<TriggerMode> {
        self.get("get_sw_trigger_mode")?;
        Ok(self.params.sw_trigger_mode)
    }

    fn get_ext_trigger_input_mode(&mut self, _handle: Handle) -> DgtzResult<TriggerMode> {
        self.get("get_ext_trigger_input_mode")?;
        Ok(self.params.ext_trigger_mode)
    }

    fn get_run_synchronization_mode(&mut self, _handle: Handle) -> DgtzResult<u32> {
        self.get("get_run_synchronization_mode")?;
        Ok(self.params.run_sync_mode)
    }

    fn get_io_level(&mut self, _handle: Handle) -> DgtzResult<IoLevel> {
        self.get("get_io_level")?;
        Ok(self.params.io_level)
    }

    fn get_trigger_polarity(
        &mut self,
        _handle: Handle,
        _channel: u32,
    ) -> DgtzResult<TriggerPolarity> {
        self.get("get_trigger_polarity")?;
        Ok(self.params.trigger_polarity)
    }

    fn get_group_fast_trigger_threshold(
        &mut self,
        _handle: Handle,
        group: u32,
    ) -> DgtzResult<u32> {
        self.get("get_group_fast_trigger_threshold")?;
        self.params
            .fast_trigger_threshold
            .get(group as usize)
            .copied()
            .ok_or(DgtzReturn::InvalidParam)
    }

    fn get_group_fast_trigger_dc_offset(
        &mut self,
        _handle: Handle,
        group: u32,
    ) -> DgtzResult<u32> {
        self.get("get_group_fast_trigger_dc_offset")?;
        self.params
            .fast_trigger_dc_offset
            .get(group as usize)
            .copied()
            .ok_or(DgtzReturn::InvalidParam)
    }

    fn get_post_trigger_size(&mut self, _handle: Handle) -> DgtzResult<u32> {
        self.get("get_post_trigger_size")?;
        Ok(self.params.post_trigger_size)
    }

    fn get_acquisition_mode(&mut self, _handle: Handle) -> DgtzResult<AcqMode> {
        self.get("get_acquisition_mode")?;
        Ok(self.params.acq_mode)
    }

    fn malloc_readout_buffer(&mut self, _handle: Handle) -> DgtzResult<usize> {
        self.call(SimCall::MallocReadoutBuffer)?;
        Ok(self.frame_len.max(1024))
    }

    fn sw_start_acquisition(&mut self, _handle: Handle) -> DgtzResult<()> {
        self.call(SimCall::Start)?;
        self.running = true;
        Ok(())
    }

    fn sw_stop_acquisition(&mut self, _handle: Handle) -> DgtzResult<()> {
        self.call(SimCall::Stop)?;
        self.running = false;
        Ok(())
    }

    fn read_data(&mut self, _handle: Handle, buffer: &mut Vec<u8>) -> DgtzResult<usize> {
        self.call(SimCall::ReadData)?;
        let frame = self.next_frame();
        buffer.clear();
        buffer.extend_from_slice(&frame);
        Ok(buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Handle = 0;

    #[test]
    fn script_then_fallback() {
        let ms = Duration::from_millis(1);
        let mut sim = SimDigitizer::scripted(
            [SimPoll::ready(ms), SimPoll::failed(DgtzReturn::CommError, ms)],
            SimPoll::idle(Duration::from_secs(2)),
        );
        sim.sw_start_acquisition(H).unwrap();
        let clock = sim.clock();

        let ready = AcqStatus::from(sim.read_register(H, ACQ_STATUS).unwrap());
        assert!(ready.running() && ready.event_ready());
        assert_eq!(
            sim.read_register(H, ACQ_STATUS),
            Err(DgtzReturn::CommError)
        );
        let idle = AcqStatus::from(sim.read_register(H, ACQ_STATUS).unwrap());
        assert!(!idle.event_ready());
        assert_eq!(clock.elapsed(), Duration::from_millis(2002));
    }

    #[test]
    fn generated_frames_carry_their_index() {
        let mut sim = SimDigitizer::new();
        sim.push_frame(vec![9, 9]);
        let mut buf = Vec::new();
        assert_eq!(sim.read_data(H, &mut buf), Ok(2));
        assert_eq!(buf, [9, 9]);
        assert_eq!(sim.read_data(H, &mut buf), Ok(16));
        assert_eq!(&buf[..4], &1u32.to_le_bytes());
    }

    #[test]
    fn group_wide_offset_write() {
        let mut sim = SimDigitizer::new();
        sim.write_register(H, 0x1198, (0xf << 17) | 0x6abc).unwrap();
        for ch in 0..8 {
            sim.write_register(H, 0x11A4, ch).unwrap();
            assert_eq!(sim.read_register(H, 0x1198).unwrap() & 0xFFFF, 0x6abc);
        }
        assert_eq!(sim.read_register(H, 0x1098).unwrap() & 0xFFFF, 0);
    }

    #[test]
    fn spills_only_trigger_inside_the_spill() {
        let pattern = SpillPattern {
            poll_period: Duration::from_millis(1),
            spill_length: Duration::from_millis(100),
            spill_gap: Duration::from_millis(100),
            trigger_probability: 1.0,
        };
        let mut sim = SimDigitizer::with_spills(pattern, 7);
        let ready: Vec<bool> = (0..200)
            .map(|_| AcqStatus::from(sim.read_register(H, ACQ_STATUS).unwrap()).event_ready())
            .collect();
        assert!(ready[..100].iter().all(|&r| r));
        assert!(ready[100..].iter().all(|&r| !r));
    }

    #[test]
    fn latch_setters_ignore_missing_channels() {
        let mut sim = SimDigitizer::new();
        sim.set_group_busy(2, true);
        sim.set_channel_offset(0, 8, 0x1234);
        sim.set_channel_offset(5, 0, 0x1234);
        sim.set_channel_threshold(1, 9, 7);
        sim.set_channel_offset(1, 3, 0x0abc);

        sim.write_register(H, 0x11A4, 3).unwrap();
        assert_eq!(sim.read_register(H, 0x1198).unwrap() & 0xFFFF, 0x0abc);
        assert_eq!(sim.read_register(H, 0x1088).unwrap(), 0);
        assert_eq!(sim.read_register(H, 0x1188).unwrap(), 0);
    }

    #[test]
    fn injected_failures_are_recorded() {
        let mut sim = SimDigitizer::new();
        sim.fail("set_record_length", DgtzReturn::InvalidParam);
        assert_eq!(
            sim.set_record_length(H, 520),
            Err(DgtzReturn::InvalidParam)
        );
        assert_eq!(sim.params().record_length, 1024);
        assert_eq!(sim.count_calls("set_record_length"), 1);
        sim.clear_failures();
        assert!(sim.set_record_length(H, 520).is_ok());
    }
}
