use anyhow::Result;
use clap::Parser;
use dt5742::*;
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{fs::File, path::PathBuf, process};

#[derive(Parser, Debug)]
#[command(version, about = "Acquire events from a CAEN DT5742 into a raw data file")]
struct Args {
    /// TOML configuration file, ignored if missing
    #[arg(short, long, default_value = "dt5742.toml")]
    config: PathBuf,

    /// Number of events to acquire
    #[arg(short = 'n', long)]
    events: Option<usize>,

    /// Raw output file
    #[arg(short, long)]
    output: Option<String>,

    /// Use the built-in simulated board instead of the hardware
    #[arg(long)]
    simulate: bool,

    /// Seed for the simulated trigger pattern
    #[arg(long, default_value_t = 5742)]
    seed: u64,
}

fn init_logging(level: LevelFilter, log_file: Option<&str>) -> Result<()> {
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        loggers.push(WriteLogger::new(level, config, File::create(path)?));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn run<D: Digitizer, C: Clock>(mut session: Dt5742<D, C>, target: usize) {
    match session.init() {
        Ok(()) => {}
        Err(e @ InitError::Open(_)) => {
            error!("{e}");
            process::exit(1);
        }
        Err(e) => {
            // The session closed itself; there is nothing to acquire from.
            error!("{e}");
            return;
        }
    }

    match session.read(target) {
        Ok(summary) => info!(
            "Recorded {} events, {} bytes",
            summary.counters.events_recorded, summary.counters.bytes_written
        ),
        Err(e) => error!("Acquisition failed: {e:#}"),
    }
    let _ = session.close();
}

#[cfg(feature = "caen")]
fn run_hardware(conf: Conf, target: usize) -> Result<()> {
    run(Dt5742::new(CaenDigitizer::new(), conf), target);
    Ok(())
}

#[cfg(not(feature = "caen"))]
fn run_hardware(_conf: Conf, _target: usize) -> Result<()> {
    anyhow::bail!("built without the `caen` feature, only --simulate is available")
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut conf = Conf::load(&args.config)?;
    if let Some(events) = args.events {
        conf.run_settings.target_events = events;
    }
    if let Some(output) = args.output {
        conf.run_settings.output_file = output;
    }
    conf.validate()?;
    init_logging(conf.log_level()?, conf.run_settings.log_file.as_deref())?;

    let target = conf.run_settings.target_events;
    info!("***********************************************");
    info!(" START ACQUISITION: AIM {target} EVENTS");
    info!("***********************************************");

    if args.simulate {
        let sim = SimDigitizer::with_spills(SpillPattern::default(), args.seed);
        let clock = sim.clock();
        run(Dt5742::with_clock(sim, conf, clock), target);
    } else if let Err(e) = run_hardware(conf, target) {
        error!("{e:#}");
        process::exit(1);
    }

    Ok(())
}
