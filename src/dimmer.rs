//! Idle-driven dimming.
//!
//! The dimmer polls idle time and flips between `Active` and `Dimmed`. The
//! brightness in force before dimming travels inside the `Dimmed` state, and
//! whatever ends the dimmer (cancellation, an early return, unwinding) puts it
//! back before the process exits.

use std::fmt;
use std::mem;
use std::time::Duration;

use chrono::Local;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DimmerConfig, JsonStore};
use crate::error::Result;
use crate::idle::IdleSource;
use crate::session::DeviceSession;

/// Idle below this means someone is at the machine, whatever the threshold says.
pub const ACTIVE_FLOOR: Duration = Duration::from_secs(60);

/// Lowest brightness ever restored; a remembered 0 would leave the panel black.
pub const SAFETY_FLOOR: u8 = 10;

/// Brightness reads and writes the dimmer needs from a device.
pub trait BrightnessControl {
    /// Best available reading; never fails.
    fn current_level(&mut self) -> u8;

    /// Apply `value` and return what the device reports as applied.
    fn apply_level(&mut self, value: u8, allow_zero: bool) -> Result<u8>;
}

impl BrightnessControl for DeviceSession {
    fn current_level(&mut self) -> u8 {
        self.get_brightness().value
    }

    fn apply_level(&mut self, value: u8, allow_zero: bool) -> Result<u8> {
        self.set_brightness(i32::from(value), allow_zero)
            .map(|ack| ack.applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimmerState {
    Active,
    Dimmed { before: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    Dimmed { before: u8 },
    Restored { to: u8 },
    /// Active with a black panel; raised to the safety floor.
    SafetyRaised,
    DimFailed,
    RestoreFailed,
}

/// Level to restore when leaving `Dimmed { before }`.
pub fn restore_level(before: u8) -> u8 {
    if before == 0 { SAFETY_FLOOR } else { before }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DimmerStatus {
    pub idle: Duration,
    pub brightness: u8,
    pub threshold: Duration,
    pub dim_level: u8,
    pub interval: Duration,
    pub state: DimmerState,
}

impl fmt::Display for DimmerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idle = Duration::from_secs(self.idle.as_secs());
        writeln!(f, "idle time:      {}", humantime::format_duration(idle))?;
        writeln!(f, "brightness:     {}%", self.brightness)?;
        writeln!(
            f,
            "dim after:      {}",
            humantime::format_duration(self.threshold)
        )?;
        writeln!(f, "dim level:      {}%", self.dim_level)?;
        writeln!(
            f,
            "check interval: {}",
            humantime::format_duration(self.interval)
        )?;
        match self.state {
            DimmerState::Active => write!(f, "state:          active"),
            DimmerState::Dimmed { before } => {
                write!(f, "state:          dimmed (was {before}%)")
            }
        }
    }
}

pub struct AutoDimmer<I: IdleSource, B: BrightnessControl> {
    idle: I,
    device: B,
    config: DimmerConfig,
    store: JsonStore<DimmerConfig>,
    state: DimmerState,
}

impl<I: IdleSource, B: BrightnessControl> AutoDimmer<I, B> {
    pub fn new(
        idle: I,
        device: B,
        mut config: DimmerConfig,
        store: JsonStore<DimmerConfig>,
    ) -> Self {
        config.normalize();
        Self {
            idle,
            device,
            config,
            store,
            state: DimmerState::Active,
        }
    }

    pub fn state(&self) -> DimmerState {
        self.state
    }

    pub fn config(&self) -> &DimmerConfig {
        &self.config
    }

    /// One poll: sample idle time and make at most one transition.
    pub fn tick(&mut self) -> TickOutcome {
        let idle = self.idle.sample();
        debug!(idle = %humantime::format_duration(Duration::from_secs(idle.as_secs())), state = ?self.state, "idle sampled");

        if idle < ACTIVE_FLOOR {
            return match self.state {
                DimmerState::Dimmed { before } => self.restore(before),
                DimmerState::Active => self.enforce_floor(),
            };
        }
        if idle > self.config.idle_threshold() && self.state == DimmerState::Active {
            return self.dim();
        }
        TickOutcome::Unchanged
    }

    /// Poll until `cancel` fires, then restore if dimmed.
    ///
    /// Blocking; `handle` only drives the wait between ticks so a command in
    /// flight always completes before cancellation is observed.
    pub fn run(&mut self, cancel: &CancellationToken, handle: &Handle) {
        info!(
            threshold = %humantime::format_duration(self.config.idle_threshold()),
            dim_level = self.config.dim_level,
            interval = %humantime::format_duration(self.config.poll_interval()),
            "auto-dimmer running"
        );
        let brightness = self.device.current_level();
        info!(brightness, "connection check: current brightness");
        loop {
            let outcome = self.tick();
            if outcome != TickOutcome::Unchanged {
                debug!(?outcome, "tick finished");
            }

            let interval = self.config.poll_interval();
            let cancelled = handle.block_on(async {
                tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(interval) => false,
                }
            });
            if cancelled {
                info!("shutdown requested");
                break;
            }
        }
        self.shutdown();
    }

    /// Best-effort restore when dimmed. Runs at most once per dimming.
    pub fn shutdown(&mut self) {
        let DimmerState::Dimmed { before } = mem::replace(&mut self.state, DimmerState::Active)
        else {
            return;
        };
        let target = restore_level(before);
        info!(brightness = target, "restoring brightness before exit");
        if let Err(err) = self.device.apply_level(target, false) {
            error!(error = %err, brightness = target, "failed to restore brightness on exit");
        }
    }

    pub fn status(&mut self) -> DimmerStatus {
        DimmerStatus {
            idle: self.idle.sample(),
            brightness: self.device.current_level(),
            threshold: self.config.idle_threshold(),
            dim_level: self.config.dim_level,
            interval: self.config.poll_interval(),
            state: self.state,
        }
    }

    /// Persist the current settings, stamped with the save time.
    pub fn save_config(&mut self) -> Result<()> {
        self.config.last_updated = Some(Local::now());
        self.store.save(&self.config)?;
        info!(path = %self.store.path().display(), "auto-dimmer settings saved");
        Ok(())
    }

    fn dim(&mut self) -> TickOutcome {
        let before = self.device.current_level();
        match self.device.apply_level(self.config.dim_level, true) {
            Ok(applied) => {
                info!(before, brightness = applied, "state transition: ACTIVE -> DIMMED");
                self.state = DimmerState::Dimmed { before };
                TickOutcome::Dimmed { before }
            }
            Err(err) => {
                warn!(error = %err, "failed to dim display; will retry");
                TickOutcome::DimFailed
            }
        }
    }

    fn restore(&mut self, before: u8) -> TickOutcome {
        let target = restore_level(before);
        match self.device.apply_level(target, false) {
            Ok(applied) => {
                info!(brightness = applied, "state transition: DIMMED -> ACTIVE");
                self.state = DimmerState::Active;
                TickOutcome::Restored { to: applied }
            }
            Err(err) => {
                warn!(error = %err, "failed to restore brightness; will retry");
                TickOutcome::RestoreFailed
            }
        }
    }

    fn enforce_floor(&mut self) -> TickOutcome {
        if self.device.current_level() != 0 {
            return TickOutcome::Unchanged;
        }
        warn!("display is black while user is active; raising brightness");
        match self.device.apply_level(SAFETY_FLOOR, false) {
            Ok(_) => TickOutcome::SafetyRaised,
            Err(err) => {
                warn!(error = %err, "failed to raise brightness");
                TickOutcome::Unchanged
            }
        }
    }
}

impl<I: IdleSource, B: BrightnessControl> Drop for AutoDimmer<I, B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::error::Error;

    struct ScriptedIdle(VecDeque<Duration>);

    impl IdleSource for ScriptedIdle {
        fn sample(&mut self) -> Duration {
            if self.0.len() > 1 {
                self.0.pop_front().unwrap_or_default()
            } else {
                self.0.front().copied().unwrap_or_default()
            }
        }
    }

    fn idle(secs: &[u64]) -> ScriptedIdle {
        ScriptedIdle(secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    #[derive(Default)]
    struct Panel {
        level: u8,
        failing: bool,
        reads: usize,
        writes: Vec<(u8, bool)>,
    }

    #[derive(Clone, Default)]
    struct FakePanel(Arc<Mutex<Panel>>);

    impl FakePanel {
        fn at(level: u8) -> Self {
            let panel = Self::default();
            panel.0.lock().unwrap().level = level;
            panel
        }

        fn writes(&self) -> Vec<(u8, bool)> {
            self.0.lock().unwrap().writes.clone()
        }

        fn set_failing(&self, failing: bool) {
            self.0.lock().unwrap().failing = failing;
        }

        fn reads(&self) -> usize {
            self.0.lock().unwrap().reads
        }
    }

    impl BrightnessControl for FakePanel {
        fn current_level(&mut self) -> u8 {
            let mut panel = self.0.lock().unwrap();
            panel.reads += 1;
            panel.level
        }

        fn apply_level(&mut self, value: u8, allow_zero: bool) -> Result<u8> {
            let mut panel = self.0.lock().unwrap();
            panel.writes.push((value, allow_zero));
            if panel.failing {
                return Err(Error::ConnectionLost("unplugged".into()));
            }
            panel.level = value;
            Ok(value)
        }
    }

    fn dimmer(
        idle: ScriptedIdle,
        panel: &FakePanel,
        dir: &tempfile::TempDir,
    ) -> AutoDimmer<ScriptedIdle, FakePanel> {
        AutoDimmer::new(
            idle,
            panel.clone(),
            DimmerConfig::default(),
            JsonStore::new(dir.path().join("auto_dimmer.json")).pretty(),
        )
    }

    #[test]
    fn dims_when_idle_and_restores_previous_level() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(55);
        let mut dimmer = dimmer(idle(&[700, 5]), &panel, &dir);

        assert_eq!(dimmer.tick(), TickOutcome::Dimmed { before: 55 });
        assert_eq!(dimmer.state(), DimmerState::Dimmed { before: 55 });
        assert_eq!(dimmer.tick(), TickOutcome::Restored { to: 55 });
        assert_eq!(dimmer.state(), DimmerState::Active);
        assert_eq!(panel.writes(), vec![(0, true), (55, false)]);
    }

    #[test]
    fn restore_never_returns_to_black() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(0);
        let mut dimmer = dimmer(idle(&[700, 5]), &panel, &dir);

        assert_eq!(dimmer.tick(), TickOutcome::Dimmed { before: 0 });
        assert_eq!(dimmer.tick(), TickOutcome::Restored { to: SAFETY_FLOOR });
        assert_eq!(panel.writes(), vec![(0, true), (10, false)]);
    }

    #[test]
    fn active_floor_beats_short_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(55);
        let mut dimmer = AutoDimmer::new(
            idle(&[45]),
            panel.clone(),
            DimmerConfig {
                idle_minutes: 0.5,
                ..DimmerConfig::default()
            },
            JsonStore::new(dir.path().join("auto_dimmer.json")),
        );
        assert_eq!(dimmer.tick(), TickOutcome::Unchanged);
        assert_eq!(dimmer.state(), DimmerState::Active);
        assert!(panel.writes().is_empty());
    }

    #[test]
    fn failed_restore_stays_dimmed_until_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(80);
        let mut dimmer = dimmer(idle(&[700, 5]), &panel, &dir);

        dimmer.tick();
        panel.set_failing(true);
        assert_eq!(dimmer.tick(), TickOutcome::RestoreFailed);
        assert_eq!(dimmer.state(), DimmerState::Dimmed { before: 80 });

        panel.set_failing(false);
        assert_eq!(dimmer.tick(), TickOutcome::Restored { to: 80 });
    }

    #[test]
    fn black_panel_while_active_is_raised() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(0);
        let mut dimmer = dimmer(idle(&[3]), &panel, &dir);
        assert_eq!(dimmer.tick(), TickOutcome::SafetyRaised);
        assert_eq!(panel.writes(), vec![(SAFETY_FLOOR, false)]);
    }

    #[test]
    fn between_floor_and_threshold_nothing_happens() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(40);
        let mut dimmer = dimmer(idle(&[300]), &panel, &dir);
        assert_eq!(dimmer.tick(), TickOutcome::Unchanged);
        assert!(panel.writes().is_empty());
    }

    #[test]
    fn dropping_while_dimmed_restores_once() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(65);
        let mut dimmer = dimmer(idle(&[900]), &panel, &dir);
        dimmer.tick();
        dimmer.shutdown();
        drop(dimmer);
        assert_eq!(panel.writes(), vec![(0, true), (65, false)]);
    }

    #[test]
    fn cancellation_ends_loop_and_restores() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(55);
        let mut dimmer = dimmer(idle(&[700]), &panel, &dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        dimmer.run(&cancel, runtime.handle());
        assert_eq!(dimmer.state(), DimmerState::Active);
        assert_eq!(panel.writes(), vec![(0, true), (55, false)]);
    }

    #[test]
    fn run_reads_brightness_once_before_polling() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(40);
        let mut dimmer = dimmer(idle(&[300]), &panel, &dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        dimmer.run(&cancel, runtime.handle());
        assert_eq!(panel.reads(), 1);
        assert!(panel.writes().is_empty());
    }

    #[test]
    fn unusable_threshold_is_replaced_with_default() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(55);
        let mut dimmer = AutoDimmer::new(
            idle(&[700]),
            panel.clone(),
            DimmerConfig {
                idle_minutes: f64::INFINITY,
                ..DimmerConfig::default()
            },
            JsonStore::new(dir.path().join("auto_dimmer.json")),
        );
        assert_eq!(dimmer.config().idle_threshold(), Duration::from_secs(600));
        assert_eq!(dimmer.tick(), TickOutcome::Dimmed { before: 55 });
    }

    #[test]
    fn save_config_stamps_time() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(55);
        let mut dimmer = dimmer(idle(&[0]), &panel, &dir);
        dimmer.save_config().unwrap();
        let saved = JsonStore::<DimmerConfig>::new(dir.path().join("auto_dimmer.json")).load();
        assert!(saved.last_updated.is_some());
        assert_eq!(saved.idle_minutes, 10.0);
    }

    #[test]
    fn status_reports_state() {
        let dir = tempfile::tempdir().unwrap();
        let panel = FakePanel::at(42);
        let mut dimmer = dimmer(idle(&[125]), &panel, &dir);
        let status = dimmer.status();
        assert_eq!(status.brightness, 42);
        assert_eq!(status.threshold, Duration::from_secs(600));
        let text = status.to_string();
        assert!(text.contains("2m 5s"));
        assert!(text.contains("state:          active"));
    }
}
