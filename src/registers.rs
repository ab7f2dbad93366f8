//! Register map of the DT5742 and the per-channel DC offset helpers.
//!
//! The board has two groups of eight channels. Each group exposes its own
//! channel-select latch, DC offset register and status register; selecting a
//! channel through the latch decides which channel the offset register reads
//! back.

use log::error;
use thiserror::Error;

use crate::{DgtzReturn, Digitizer, Handle};

/// Acquisition status. Bit 2 running, bit 3 event ready, bit 4 buffer full.
pub const ACQ_STATUS: u32 = 0x8104;
/// Global trigger mask. Bit 30 external trigger, bit 31 software trigger.
pub const GLOBAL_TRIGGER_MASK: u32 = 0x810C;
/// Front panel IO control.
pub const FRONT_PANEL_IO_CTRL: u32 = 0x811C;
/// TR0 fast trigger threshold.
pub const TR0_THRESHOLD: u32 = 0x10D4;
/// TR0 fast trigger DC offset.
pub const TR0_DC_OFFSET: u32 = 0x10DC;

/// Busy flag in a group status register. Offsets must not be written while set.
pub const GROUP_BUSY: u32 = 0x2;

pub const CHANNELS_PER_GROUP: u8 = 8;
pub const GROUPS: u8 = 2;

const GROUP_STRIDE: u32 = 0x100;

/// Per-group register block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupRegisters {
    pub threshold: u32,
    pub status: u32,
    pub dc_offset: u32,
    pub channel_select: u32,
}

impl GroupRegisters {
    /// Register block of `group`, or `None` for groups the board does not have.
    pub fn of(group: u8) -> Option<Self> {
        if group >= GROUPS {
            return None;
        }
        let base = group as u32 * GROUP_STRIDE;
        Some(Self {
            threshold: 0x1080 + base,
            status: 0x1088 + base,
            dc_offset: 0x1098 + base,
            channel_select: 0x10A4 + base,
        })
    }
}

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetError {
    #[error("bad channel {0}, only 0-7 exist in a group")]
    BadChannel(u8),
    #[error("bad group {0}, only groups 0 and 1 exist")]
    BadGroup(u8),
    #[error("DC offset {0} too large, only have 16 bits")]
    OffsetRange(u32),
    #[error("group {0} status busy bit set, wait a while")]
    GroupBusy(u8),
    #[error("digitizer call failed: {0} ({})", .0.code())]
    Dgtz(#[from] DgtzReturn),
}

fn group_registers(group: u8, channel: u8) -> Result<GroupRegisters, OffsetError> {
    if channel >= CHANNELS_PER_GROUP {
        return Err(OffsetError::BadChannel(channel));
    }
    GroupRegisters::of(group).ok_or(OffsetError::BadGroup(group))
}

/// Reads back the DC offset of `channel` in `group`.
///
/// Moves the group's channel-select latch to `channel` as a side effect.
pub fn channel_offset<D: Digitizer + ?Sized>(
    dgtz: &mut D,
    handle: Handle,
    group: u8,
    channel: u8,
) -> Result<u16, OffsetError> {
    let regs = group_registers(group, channel).inspect_err(|e| error!("Channel offset: {e}"))?;

    dgtz.write_register(handle, regs.channel_select, channel as u32)
        .inspect_err(|e| error!("Error selecting channel {channel}: {e} ({})", e.code()))?;
    let value = dgtz
        .read_register(handle, regs.dc_offset)
        .inspect_err(|e| error!("Error reading DC offset: {e} ({})", e.code()))?;

    Ok((value & 0xFFFF) as u16)
}

/// Writes the 16-bit DC offset of `channel` in `group`.
///
/// Refuses to write while the group status reports busy.
pub fn write_dc_offset<D: Digitizer + ?Sized>(
    dgtz: &mut D,
    handle: Handle,
    group: u8,
    channel: u8,
    offset: u32,
) -> Result<(), OffsetError> {
    let regs = group_registers(group, channel).inspect_err(|e| error!("DC offset: {e}"))?;
    if offset > 0xFFFF {
        let err = OffsetError::OffsetRange(offset);
        error!("{err}");
        return Err(err);
    }

    let status = dgtz
        .read_register(handle, regs.status)
        .inspect_err(|e| error!("Error reading group status: {e} ({})", e.code()))?;
    if status & GROUP_BUSY != 0 {
        let err = OffsetError::GroupBusy(group);
        error!("{err}");
        return Err(err);
    }

    let word = ((channel as u32) << 16) | offset;
    dgtz.write_register(handle, regs.dc_offset, word)
        .inspect_err(|e| error!("Error writing DC offset: {e} ({})", e.code()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimCall, SimDigitizer};

    const H: Handle = 0;

    fn register_calls(sim: &SimDigitizer) -> usize {
        sim.calls()
            .iter()
            .filter(|c| matches!(c, SimCall::ReadRegister(_) | SimCall::WriteRegister(..)))
            .count()
    }

    #[test]
    fn group_blocks_are_disjoint() {
        let g0 = GroupRegisters::of(0).unwrap();
        let g1 = GroupRegisters::of(1).unwrap();
        assert_eq!(g0.channel_select, 0x10A4);
        assert_eq!(g0.dc_offset, 0x1098);
        assert_eq!(g0.status, 0x1088);
        assert_eq!(g1.channel_select, 0x11A4);
        assert_eq!(g1.dc_offset, 0x1198);
        assert_eq!(g1.status, 0x1188);
        assert_eq!(GroupRegisters::of(2), None);
    }

    #[test]
    fn out_of_range_arguments_touch_no_register() {
        let mut sim = SimDigitizer::new();
        for (group, channel) in [(0, 8), (1, 200), (2, 0), (7, 3)] {
            assert!(channel_offset(&mut sim, H, group, channel).is_err());
            assert!(write_dc_offset(&mut sim, H, group, channel, 0x1234).is_err());
        }
        assert_eq!(
            channel_offset(&mut sim, H, 0, 8),
            Err(OffsetError::BadChannel(8))
        );
        assert_eq!(
            write_dc_offset(&mut sim, H, 2, 0, 1),
            Err(OffsetError::BadGroup(2))
        );
        assert_eq!(register_calls(&sim), 0);
    }

    #[test]
    fn offsets_above_16_bits_are_rejected() {
        let mut sim = SimDigitizer::new();
        assert_eq!(
            write_dc_offset(&mut sim, H, 0, 0, 65536),
            Err(OffsetError::OffsetRange(65536))
        );
        assert_eq!(register_calls(&sim), 0);
        assert!(write_dc_offset(&mut sim, H, 0, 0, 65535).is_ok());
    }

    #[test]
    fn busy_group_blocks_the_write() {
        let mut sim = SimDigitizer::new();
        sim.set_group_busy(1, true);
        assert_eq!(
            write_dc_offset(&mut sim, H, 1, 3, 0x7fff),
            Err(OffsetError::GroupBusy(1))
        );
        assert!(!sim
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::WriteRegister(..))));

        sim.set_group_busy(1, false);
        assert!(write_dc_offset(&mut sim, H, 1, 3, 0x7fff).is_ok());
        assert_eq!(sim.register(0x1198), (3 << 16) | 0x7fff);
    }

    #[test]
    fn read_selects_the_channel_first() {
        let mut sim = SimDigitizer::new();
        sim.set_channel_offset(1, 5, 0x4321);
        assert_eq!(channel_offset(&mut sim, H, 1, 5), Ok(0x4321));
        assert_eq!(
            sim.calls(),
            &[
                SimCall::WriteRegister(0x11A4, 5),
                SimCall::ReadRegister(0x1198)
            ]
        );
    }

    #[test]
    fn read_then_write_back_is_a_no_op() {
        let mut sim = SimDigitizer::new();
        sim.set_channel_offset(0, 2, 0x6abc);
        sim.set_channel_offset(0, 3, 0x1111);

        let before = channel_offset(&mut sim, H, 0, 2).unwrap();
        write_dc_offset(&mut sim, H, 0, 2, before as u32).unwrap();
        assert_eq!(channel_offset(&mut sim, H, 0, 2), Ok(before));
        assert_eq!(channel_offset(&mut sim, H, 0, 3), Ok(0x1111));
    }

    #[test]
    fn vendor_failures_are_returned() {
        let mut sim = SimDigitizer::new();
        sim.fail_register(0x1088, DgtzReturn::CommError);
        assert_eq!(
            write_dc_offset(&mut sim, H, 0, 0, 10),
            Err(OffsetError::Dgtz(DgtzReturn::CommError))
        );
        assert!(!sim
            .calls()
            .iter()
            .any(|c| matches!(c, SimCall::WriteRegister(..))));
    }
}
