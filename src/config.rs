use anyhow::{bail, Result};
use confique::Config;
use log::LevelFilter;
use std::{path::Path, time::Duration};

use crate::{Drs4Frequency, TriggerMode};

/// Record lengths the x742 family accepts, in samples.
pub const X742_RECORD_LENGTHS: &[u32] = &[1024, 520, 256, 136];

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub link: LinkSettings,
    #[config(nested)]
    pub board_settings: BoardSettings,
    #[config(nested)]
    pub run_settings: RunSettings,
}

/// How to reach the board. The defaults select the first USB link.
#[derive(Config, Debug, Clone)]
pub struct LinkSettings {
    #[config(default = 0)]
    pub link_type: u32,
    #[config(default = 0)]
    pub link_num: i32,
    #[config(default = 0)]
    pub conet_node: i32,
    #[config(default = 0)]
    pub vme_base_address: u32,
}

#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    #[config(default = 500)]
    pub settle_ms: u64,
    #[config(default = 1024)]
    pub record_len: u32,
    #[config(default = 3)]
    pub group_enable_mask: u32,
    #[config(default = 65535)]
    pub channel_enable_mask: u32,
    #[config(default = 1)]
    pub max_aggregates_blt: u32,
    #[config(default = "5GHz")]
    pub drs4_frequency: Drs4Frequency,
    #[config(default = "AcqOnly")]
    pub fast_trigger_mode: TriggerMode,
    #[config(default = false)]
    pub fast_trigger_digitizing: bool,
    /// Written verbatim to the front panel IO control register.
    /// Default is `(3 << 18) | (1 << 16)`.
    #[config(default = 851968)]
    pub front_panel_io: u32,
    /// Written verbatim to the DC offset register of each group.
    /// Default is `(0xf << 17) | 0x6abc`.
    #[config(default = [1993404, 1993404])]
    pub group_dc_offset: [u32; 2],
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 25000, env = "DT5742_EVENTS")]
    pub target_events: usize,
    #[config(default = "output.dat", env = "DT5742_OUTPUT")]
    pub output_file: String,
    #[config(default = 1000)]
    pub spill_idle_ms: u64,
    #[config(default = 1000)]
    pub progress_every: usize,
    #[config(default = "info", env = "DT5742_LOG_LEVEL")]
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Conf {
    /// Loads the configuration from the environment and an optional TOML file,
    /// falling back to the built-in defaults for anything unset.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let conf = Conf::builder().env().file(path.as_ref()).load()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        let board = &self.board_settings;
        if !X742_RECORD_LENGTHS.contains(&board.record_len) {
            bail!(
                "record_len {} not one of {:?}",
                board.record_len,
                X742_RECORD_LENGTHS
            );
        }
        if board.group_enable_mask == 0 || board.group_enable_mask > 0x3 {
            bail!(
                "group_enable_mask {:#x} must enable one or both of the two groups",
                board.group_enable_mask
            );
        }
        if board.channel_enable_mask > 0xffff {
            bail!(
                "channel_enable_mask {:#x} covers more than 16 channels",
                board.channel_enable_mask
            );
        }
        if board.max_aggregates_blt == 0 || board.max_aggregates_blt > 1023 {
            bail!(
                "max_aggregates_blt {} out of range 1..=1023",
                board.max_aggregates_blt
            );
        }
        let run = &self.run_settings;
        if run.spill_idle_ms == 0 {
            bail!("spill_idle_ms must be positive");
        }
        if run.progress_every == 0 {
            bail!("progress_every must be positive");
        }
        if run.output_file.is_empty() {
            bail!("output_file must not be empty");
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<LevelFilter> {
        match self.run_settings.log_level.parse() {
            Ok(level) => Ok(level),
            Err(_) => bail!("unknown log_level {:?}", self.run_settings.log_level),
        }
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.board_settings.settle_ms)
    }

    pub fn spill_timeout(&self) -> Duration {
        Duration::from_millis(self.run_settings.spill_idle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn defaults() -> Conf {
        Conf::builder().load().unwrap()
    }

    #[test]
    fn defaults_match_bench_setup() {
        let conf = defaults();
        assert_eq!(conf.board_settings.record_len, 1024);
        assert_eq!(conf.board_settings.group_enable_mask, 0x3);
        assert_eq!(conf.board_settings.channel_enable_mask, 0xffff);
        assert_eq!(conf.board_settings.max_aggregates_blt, 1);
        assert_eq!(conf.board_settings.drs4_frequency, Drs4Frequency::F5GHz);
        assert_eq!(conf.board_settings.fast_trigger_mode, TriggerMode::AcqOnly);
        assert!(!conf.board_settings.fast_trigger_digitizing);
        assert_eq!(conf.board_settings.front_panel_io, (3 << 18) | (1 << 16));
        assert_eq!(
            conf.board_settings.group_dc_offset,
            [(0xf << 17) | 0x6abc, (0xf << 17) | 0x6abc]
        );
        assert_eq!(conf.settle_time(), Duration::from_millis(500));
        assert_eq!(conf.spill_timeout(), Duration::from_secs(1));
        assert_eq!(conf.run_settings.target_events, 25000);
        assert_eq!(conf.run_settings.output_file, "output.dat");
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[board_settings]\nrecord_len = 520\ndrs4_frequency = \"1GHz\"\n\n[run_settings]\ntarget_events = 10"
        )
        .unwrap();
        let conf = Conf::builder().file(file.path()).load().unwrap();
        assert_eq!(conf.board_settings.record_len, 520);
        assert_eq!(conf.board_settings.drs4_frequency, Drs4Frequency::F1GHz);
        assert_eq!(conf.run_settings.target_events, 10);
        assert_eq!(conf.board_settings.channel_enable_mask, 0xffff);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut conf = defaults();
        conf.board_settings.record_len = 1000;
        assert!(conf.validate().is_err());

        let mut conf = defaults();
        conf.board_settings.group_enable_mask = 0x4;
        assert!(conf.validate().is_err());

        let mut conf = defaults();
        conf.run_settings.progress_every = 0;
        assert!(conf.validate().is_err());

        let mut conf = defaults();
        conf.run_settings.log_level = "chatty".into();
        assert!(conf.validate().is_err());
    }
}
