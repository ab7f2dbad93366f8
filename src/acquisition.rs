use anyhow::{Context, Result};
use log::{error, info, warn};
use std::{
    io::{self, Write},
    time::{Duration, Instant},
};
use time::OffsetDateTime;

use crate::{registers::ACQ_STATUS, Clock, Conf, DgtzReturn, Digitizer, Handle};

/// Snapshot of the acquisition status register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcqStatus(pub u32);

impl AcqStatus {
    pub const RUNNING: u32 = 1 << 2;
    pub const EVENT_READY: u32 = 1 << 3;
    pub const BUFFER_FULL: u32 = 1 << 4;

    pub fn running(self) -> bool {
        self.0 & Self::RUNNING != 0
    }

    pub fn event_ready(self) -> bool {
        self.0 & Self::EVENT_READY != 0
    }

    pub fn buffer_full(self) -> bool {
        self.0 & Self::BUFFER_FULL != 0
    }
}

impl From<u32> for AcqStatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Whether the board is in the middle of a burst of triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillState {
    Idle,
    InSpill,
}

impl SpillState {
    /// State after `idle` time has passed since the last drained event.
    pub fn from_idle_time(idle: Duration, timeout: Duration) -> Self {
        if idle > timeout {
            Self::Idle
        } else {
            Self::InSpill
        }
    }

    /// A spill in progress is always drained, even past the target.
    pub fn keep_polling(self, recorded: usize, target: usize) -> bool {
        match self {
            Self::InSpill => true,
            Self::Idle => recorded < target,
        }
    }
}

/// Per-run statistics.
#[derive(Clone, Copy, Debug)]
pub struct AcqCounters {
    pub events_recorded: usize,
    pub no_event_polls: usize,
    pub buffer_full_polls: usize,
    pub iterations: usize,
    /// Polls whose status read failed; their bits were not interpreted.
    pub status_errors: usize,
    /// Ready events whose data read failed; nothing was written for them.
    pub read_errors: usize,
    pub bytes_written: usize,
    pub t_begin: Instant,
}

impl AcqCounters {
    pub fn new(t_begin: Instant) -> Self {
        Self {
            events_recorded: 0,
            no_event_polls: 0,
            buffer_full_polls: 0,
            iterations: 0,
            status_errors: 0,
            read_errors: 0,
            bytes_written: 0,
            t_begin,
        }
    }

    /// Every poll either recorded an event or saw none.
    pub fn is_consistent(&self) -> bool {
        self.iterations == self.events_recorded + self.no_event_polls
    }

    /// Average readout rate since `t_begin`, in MB/s.
    pub fn average_rate(&self, now: Instant) -> f64 {
        let secs = now
            .saturating_duration_since(self.t_begin)
            .as_secs_f64()
            .max(1e-6);
        (self.bytes_written as f64 / secs) / (1024.0 * 1024.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcqSettings {
    pub target_events: usize,
    pub spill_timeout: Duration,
    /// Polls between progress logs, 0 for none.
    pub progress_every: usize,
}

impl AcqSettings {
    pub fn from_conf(conf: &Conf) -> Self {
        Self {
            target_events: conf.run_settings.target_events,
            spill_timeout: conf.spill_timeout(),
            progress_every: conf.run_settings.progress_every,
        }
    }
}

impl Default for AcqSettings {
    fn default() -> Self {
        Self {
            target_events: 25000,
            spill_timeout: Duration::from_secs(1),
            progress_every: 1000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AcqSummary {
    pub counters: AcqCounters,
    pub final_state: SpillState,
    pub started_at: OffsetDateTime,
    pub stopped_at: OffsetDateTime,
    pub elapsed: Duration,
    pub stop_error: Option<DgtzReturn>,
}

/// One acquisition run: start, busy-poll the status register, drain ready
/// events into a sink, stop.
pub struct Acquisition<'a, D: Digitizer + ?Sized, C: Clock> {
    dgtz: &'a mut D,
    handle: Handle,
    clock: C,
    settings: AcqSettings,
    counters: AcqCounters,
    state: SpillState,
    last_event: Instant,
    buffer: Vec<u8>,
    started_at: OffsetDateTime,
}

impl<'a, D: Digitizer + ?Sized, C: Clock> Acquisition<'a, D, C> {
    pub fn new(dgtz: &'a mut D, handle: Handle, clock: C, settings: AcqSettings) -> Self {
        let now = clock.now();
        Self {
            dgtz,
            handle,
            clock,
            settings,
            counters: AcqCounters::new(now),
            state: SpillState::Idle,
            last_event: now,
            buffer: Vec::new(),
            started_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn counters(&self) -> &AcqCounters {
        &self.counters
    }

    pub fn state(&self) -> SpillState {
        self.state
    }

    pub fn keep_polling(&self) -> bool {
        self.state
            .keep_polling(self.counters.events_recorded, self.settings.target_events)
    }

    /// Allocates the readout buffer and starts the board. Failures are logged
    /// and the run carries on.
    pub fn start(&mut self) {
        match self.dgtz.malloc_readout_buffer(self.handle) {
            Ok(size) => self.buffer = Vec::with_capacity(size),
            Err(e) => error!("Could not allocate readout buffer: {e} ({})", e.code()),
        }
        if let Err(e) = self.dgtz.sw_start_acquisition(self.handle) {
            error!("Could not start acquisition: {e} ({})", e.code());
        }
        self.started_at = OffsetDateTime::now_utc();
        let now = self.clock.now();
        self.counters.t_begin = now;
        self.last_event = now;
    }

    /// One pass of the polling loop. Only a sink failure is returned.
    pub fn poll<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<SpillState> {
        let every = self.settings.progress_every;
        // Zero disables the progress log.
        if every > 0 && self.counters.iterations % every == 0 {
            info!("Number of events on disk: {}", self.counters.events_recorded);
        }
        self.counters.iterations += 1;

        match self.dgtz.read_register(self.handle, ACQ_STATUS) {
            Ok(raw) => self.handle_status(AcqStatus::from(raw), sink)?,
            Err(e) => {
                self.counters.status_errors += 1;
                warn!(
                    "Could not read acquisition status, skipping poll: {e} ({})",
                    e.code()
                );
            }
        }

        let idle = self
            .clock
            .now()
            .saturating_duration_since(self.last_event);
        self.state = SpillState::from_idle_time(idle, self.settings.spill_timeout);
        Ok(self.state)
    }

    fn handle_status<W: Write + ?Sized>(
        &mut self,
        status: AcqStatus,
        sink: &mut W,
    ) -> io::Result<()> {
        if status.buffer_full() {
            self.counters.buffer_full_polls += 1;
        }
        if !status.event_ready() {
            self.counters.no_event_polls += 1;
            return Ok(());
        }
        match self.dgtz.read_data(self.handle, &mut self.buffer) {
            Ok(_) => {
                sink.write_all(&self.buffer)?;
                self.counters.events_recorded += 1;
                self.counters.bytes_written += self.buffer.len();
                self.last_event = self.clock.now();
            }
            Err(e) => {
                self.counters.read_errors += 1;
                error!("Error reading event data: {e} ({})", e.code());
            }
        }
        Ok(())
    }

    /// Logs the run statistics, checks the counters and stops the board.
    pub fn finish(self) -> AcqSummary {
        let c = &self.counters;
        let now = self.clock.now();
        info!("=================");
        info!("===== STATS =====");
        info!("Number of events acquired: {}", c.events_recorded);
        info!("Number of cycles with no reading: {}", c.no_event_polls);
        info!("Number of cycles with buffer full: {}", c.buffer_full_polls);
        info!("Number of total read attempts: {}", c.iterations);
        if c.status_errors > 0 || c.read_errors > 0 {
            info!(
                "Failed status reads: {}, failed data reads: {}",
                c.status_errors, c.read_errors
            );
        }
        info!("Average readout rate: {:.2} MB/s", c.average_rate(now));
        if c.is_consistent() {
            info!("Every poll accounted for: no missed events");
        } else {
            warn!(
                "Check stats: {} polls but {} events + {} empty polls",
                c.iterations, c.events_recorded, c.no_event_polls
            );
        }

        let stop_error = self.dgtz.sw_stop_acquisition(self.handle).err();
        if let Some(e) = stop_error {
            error!("Could not stop acquisition: {e} ({})", e.code());
        }

        AcqSummary {
            counters: self.counters,
            final_state: self.state,
            started_at: self.started_at,
            stopped_at: OffsetDateTime::now_utc(),
            elapsed: now.saturating_duration_since(self.counters.t_begin),
            stop_error,
        }
    }

    /// Runs until the target is reached and no spill is in progress.
    pub fn run<W: Write + ?Sized>(mut self, sink: &mut W) -> Result<AcqSummary> {
        self.start();
        let mut outcome = Ok(());
        while self.keep_polling() {
            if let Err(e) = self.poll(sink) {
                outcome = Err(e);
                break;
            }
        }
        let outcome = outcome.and_then(|_| sink.flush());
        let summary = self.finish();
        outcome.context("writing event data")?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SimCall, SimDigitizer, SimPoll};

    const H: Handle = 0;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn settings(target: usize) -> AcqSettings {
        AcqSettings {
            target_events: target,
            ..AcqSettings::default()
        }
    }

    /// Status script with ready on the given 1-based polls, 1 ms per poll.
    fn ready_on(polls: &[usize], len: usize) -> Vec<SimPoll> {
        (1..=len)
            .map(|i| {
                if polls.contains(&i) {
                    SimPoll::ready(ms(1))
                } else {
                    SimPoll::idle(ms(1))
                }
            })
            .collect()
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn spill_transitions() {
        let timeout = Duration::from_secs(1);
        assert_eq!(SpillState::from_idle_time(ms(0), timeout), SpillState::InSpill);
        assert_eq!(
            SpillState::from_idle_time(ms(1000), timeout),
            SpillState::InSpill
        );
        assert_eq!(SpillState::from_idle_time(ms(1001), timeout), SpillState::Idle);

        assert!(SpillState::Idle.keep_polling(2, 3));
        assert!(!SpillState::Idle.keep_polling(3, 3));
        assert!(SpillState::InSpill.keep_polling(3, 3));
        assert!(SpillState::InSpill.keep_polling(10, 3));
    }

    #[test]
    fn status_bits() {
        let s = AcqStatus::from(0b11100);
        assert!(s.running() && s.event_ready() && s.buffer_full());
        let s = AcqStatus::from(0b00100);
        assert!(s.running() && !s.event_ready() && !s.buffer_full());
    }

    #[test]
    fn counts_follow_ready_pattern() {
        let mut sim =
            SimDigitizer::scripted(ready_on(&[2, 5, 9], 12), SimPoll::idle(ms(100)));
        let clock = sim.clock();
        let mut sink = Vec::new();
        let mut acq = Acquisition::new(&mut sim, H, clock, settings(3));
        acq.start();

        let mut seen = 0;
        for n in 1..=12 {
            acq.poll(&mut sink).unwrap();
            if [2, 5, 9].contains(&n) {
                seen += 1;
            }
            let c = acq.counters();
            assert_eq!(c.iterations, n);
            assert_eq!(c.events_recorded, seen);
            assert_eq!(c.no_event_polls, n - seen);
            assert!(c.is_consistent());
        }

        while acq.keep_polling() {
            acq.poll(&mut sink).unwrap();
        }
        let summary = acq.finish();
        assert_eq!(summary.counters.events_recorded, 3);
        assert!(summary.counters.is_consistent());
        assert_eq!(summary.final_state, SpillState::Idle);
        assert_eq!(summary.stop_error, None);
    }

    #[test]
    fn long_gap_ends_the_spill_below_target() {
        let script = [
            SimPoll::ready(ms(10)),
            SimPoll::idle(ms(300)),
            SimPoll::idle(ms(1500)),
            SimPoll::ready(ms(10)),
        ];
        let mut sim = SimDigitizer::scripted(script, SimPoll::idle(ms(1)));
        let clock = sim.clock();
        let mut sink = Vec::new();
        let mut acq = Acquisition::new(&mut sim, H, clock, settings(5));
        acq.start();

        assert_eq!(acq.poll(&mut sink).unwrap(), SpillState::InSpill);
        assert_eq!(acq.poll(&mut sink).unwrap(), SpillState::InSpill);
        assert_eq!(acq.poll(&mut sink).unwrap(), SpillState::Idle);
        assert!(acq.keep_polling(), "target not reached yet");
        assert_eq!(acq.poll(&mut sink).unwrap(), SpillState::InSpill);
        assert_eq!(acq.counters().events_recorded, 2);
    }

    #[test]
    fn spill_in_progress_runs_past_target() {
        let script = vec![SimPoll::ready(ms(1)); 5];
        let mut sim = SimDigitizer::scripted(script, SimPoll::idle(ms(100)));
        let clock = sim.clock();
        let mut sink = Vec::new();
        let summary = Acquisition::new(&mut sim, H, clock.clone(), settings(1))
            .run(&mut sink)
            .unwrap();

        assert_eq!(summary.counters.events_recorded, 5);
        // 5 ready polls, then idle polls until more than a second has passed.
        assert_eq!(summary.counters.iterations, 5 + 11);
        assert_eq!(summary.final_state, SpillState::Idle);
        assert!(clock.elapsed() > ms(1005));
    }

    #[test]
    fn three_events_land_in_order() {
        let mut sim = SimDigitizer::scripted(
            vec![SimPoll::ready(ms(2)); 3],
            SimPoll::idle(ms(50)),
        );
        sim.push_frame(vec![1, 1, 1]);
        sim.push_frame(vec![2, 2]);
        sim.push_frame(vec![3, 3, 3, 3]);
        let clock = sim.clock();
        let mut sink = Vec::new();
        let summary = Acquisition::new(&mut sim, H, clock, settings(3))
            .run(&mut sink)
            .unwrap();

        assert_eq!(summary.counters.events_recorded, 3);
        assert_eq!(summary.final_state, SpillState::Idle);
        assert_eq!(sink, [1, 1, 1, 2, 2, 3, 3, 3, 3]);
        assert_eq!(summary.counters.bytes_written, 9);
        assert_eq!(sim.count_calls("read_data"), 3);
        assert_eq!(sim.count_calls("sw_start_acquisition"), 1);
        assert_eq!(sim.count_calls("sw_stop_acquisition"), 1);
        assert_eq!(sim.calls().last(), Some(&SimCall::Stop));
        assert!(!sim.is_running());
    }

    #[test]
    fn buffer_full_is_only_counted() {
        let script = [
            SimPoll::ready(ms(1)).buffer_full(),
            SimPoll::idle(ms(1)).buffer_full(),
            SimPoll::ready(ms(1)),
        ];
        let mut sim = SimDigitizer::scripted(script, SimPoll::idle(ms(500)));
        let clock = sim.clock();
        let mut sink = Vec::new();
        let summary = Acquisition::new(&mut sim, H, clock, settings(2))
            .run(&mut sink)
            .unwrap();
        assert_eq!(summary.counters.buffer_full_polls, 2);
        assert_eq!(summary.counters.events_recorded, 2);
        assert!(summary.counters.is_consistent());
    }

    #[test]
    fn failed_status_read_is_skipped_and_flagged() {
        let script = [
            SimPoll::ready(ms(1)),
            SimPoll::failed(DgtzReturn::CommError, ms(1)),
            SimPoll::ready(ms(1)),
        ];
        let mut sim = SimDigitizer::scripted(script, SimPoll::idle(ms(500)));
        let clock = sim.clock();
        let mut sink = Vec::new();
        let summary = Acquisition::new(&mut sim, H, clock, settings(2))
            .run(&mut sink)
            .unwrap();

        let c = summary.counters;
        assert_eq!(c.status_errors, 1);
        assert_eq!(c.events_recorded, 2);
        assert_eq!(c.iterations, c.events_recorded + c.no_event_polls + 1);
        assert!(!c.is_consistent());
    }

    #[test]
    fn failed_data_read_writes_nothing() {
        let mut sim = SimDigitizer::scripted([SimPoll::ready(ms(1))], SimPoll::idle(ms(1)));
        sim.fail("read_data", DgtzReturn::Timeout);
        let clock = sim.clock();
        let mut sink = Vec::new();
        let mut acq = Acquisition::new(&mut sim, H, clock, settings(1));
        acq.start();
        acq.poll(&mut sink).unwrap();
        assert_eq!(acq.counters().read_errors, 1);
        assert_eq!(acq.counters().events_recorded, 0);
        assert!(!acq.counters().is_consistent());
        assert!(sink.is_empty());
    }

    #[test]
    fn start_and_stop_failures_do_not_abort() {
        let mut sim = SimDigitizer::scripted([SimPoll::ready(ms(1))], SimPoll::idle(ms(600)));
        sim.fail("sw_start_acquisition", DgtzReturn::CommError);
        sim.fail("sw_stop_acquisition", DgtzReturn::CommError);
        sim.fail("malloc_readout_buffer", DgtzReturn::OutOfMemory);
        let clock = sim.clock();
        let mut sink = Vec::new();
        let summary = Acquisition::new(&mut sim, H, clock, settings(1))
            .run(&mut sink)
            .unwrap();
        assert_eq!(summary.counters.events_recorded, 1);
        assert_eq!(summary.stop_error, Some(DgtzReturn::CommError));
        assert_eq!(sink.len(), 16);
    }

    #[test]
    fn sink_failure_stops_the_board() {
        let mut sim = SimDigitizer::scripted([SimPoll::ready(ms(1))], SimPoll::idle(ms(600)));
        let clock = sim.clock();
        let result = Acquisition::new(&mut sim, H, clock, settings(1)).run(&mut BrokenSink);
        assert!(result.is_err());
        assert_eq!(sim.count_calls("sw_stop_acquisition"), 1);
    }

    #[test]
    fn zero_progress_interval_disables_the_progress_log() {
        let mut sim = SimDigitizer::scripted(vec![SimPoll::ready(ms(1)); 2], SimPoll::idle(ms(600)));
        let clock = sim.clock();
        let mut sink = Vec::new();
        let settings = AcqSettings {
            target_events: 1,
            progress_every: 0,
            ..AcqSettings::default()
        };
        let summary = Acquisition::new(&mut sim, H, clock, settings)
            .run(&mut sink)
            .unwrap();
        assert_eq!(summary.counters.events_recorded, 2);
        assert!(summary.counters.is_consistent());
    }

    #[test]
    fn zero_target_never_polls() {
        let mut sim = SimDigitizer::new();
        let clock = sim.clock();
        let mut sink = Vec::new();
        let summary = Acquisition::new(&mut sim, H, clock, settings(0))
            .run(&mut sink)
            .unwrap();
        assert_eq!(summary.counters.iterations, 0);
        assert_eq!(sim.count_calls("read_register"), 0);
    }
}
