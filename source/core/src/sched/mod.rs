//! Cooperative sensor scheduler
//!
//! Sensors are grouped by the power domain they share. On every tick the
//! [Scheduler] walks the groups in order and moves each through
//!
//! ```text
//! idle -> powered on, settling -> processing -> completed -> powered off -> idle
//! ```
//!
//! Inside a processing group the sensors are taken one at a time: a sensor
//! settles, is measured until it reports completion, and only then does the
//! next one start. A group whose sensors are all complete is powered off,
//! and will not run again until its repeat interval has passed.
//!
//! Groups may be exclusive in three ways, each of which defers (never
//! blocks) a group until the conflicting one is finished:
//!
//! * `exclusive`: runs alone.
//! * `power_exclusive`: never powered on alongside another such group.
//! * `twi_exclusive`: never processing alongside another such group.
//!
//! Hardware completions arrive over a channel from interrupt context, and a
//! measurement that never completes is force-completed after a deadline.

use core::marker::PhantomData;

use embassy_sync::channel::Receiver;
use heapless::Vec;

use crate::{
    battery::{Battery, BatteryStatus, OpMode},
    comm::{CommMode, ReportSource},
    config::{repeat_override, DefaultCfg, NodeCfg, Storage},
    stats::Stats,
    timer::Interval,
    uart::{Uart, UartOwner},
    wire::Report,
    Seconds,
};

mod fuel_gauge;
mod group;
mod sensor;

pub use fuel_gauge::{BatteryReading, FuelGauge, Gauge, GaugeSample};
pub use group::{skip_when_mobile, GroupConfig, Repeat};
pub use sensor::{Completion, Measure, Sensor, SensorConfig, SensorCtx, SensorId};

use group::{min_settling, GroupState};
use sensor::SensorState;

/// Most groups a scheduler can hold
pub const MAX_GROUPS: usize = 12;

/// Most sensors a group can hold
pub const MAX_SENSORS: usize = 6;

/// Depth of the hardware completion channel
pub const COMPLETIONS: usize = 8;

/// Name of the group that holds the GPS receiver, if any
pub const GPS_GROUP: &str = "g-gps";

/// Switches group power domains
pub trait PowerControl {
    /// Turn the domain identified by `param` on or off
    fn set(&mut self, param: u8, on: bool);
}

/// Why the scheduler refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum SchedError {
    /// No room for another group or sensor
    Full,
    /// No group or sensor by that name
    NotFound,
    /// Mobile mode with a fixed position makes no sense
    StaticLocation,
}

/// What changed with a new operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ModeChange {
    /// Nothing else to do
    Plain,
    /// A new mobile session started: refresh the location, and tell the service
    NewMobileSession,
}

/// The parts of the node a scheduler tick looks at
pub struct SchedEnv<'a> {
    /// Current time
    pub now: Seconds,
    /// Configuration
    pub storage: &'a Storage,
    /// Counters
    pub stats: &'a mut Stats,
    /// Shared UART
    pub uart: &'a mut Uart,
    /// Battery state
    pub battery: &'a mut Battery,
    /// Power domain switches
    pub power: &'a mut dyn PowerControl,
    /// Selected transport
    pub comm_mode: CommMode,
    /// The transport is powered, which in oneshot operation counts as busy
    pub comm_active: bool,
    /// The UART may be taken away from the transports
    pub uart_switching: bool,
    /// The location is settled, so measurements can be stamped with it
    pub gps_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestMode {
    Off,
    Requested,
    Active,
}

struct SensorSlot<'a> {
    sensor: &'a mut dyn Sensor,
    config: SensorConfig,
    state: SensorState,
}

struct GroupSlot<'a> {
    config: &'a GroupConfig,
    state: GroupState,
    sensors: Vec<SensorSlot<'a>, MAX_SENSORS>,
}

/// The sensor scheduler
pub struct Scheduler<'a, C: NodeCfg = DefaultCfg> {
    groups: Vec<GroupSlot<'a>, MAX_GROUPS>,
    completions: Option<Receiver<'a, C::Mutex, Completion, COMPLETIONS>>,
    initialized: bool,
    now: Seconds,
    op_mode: OpMode,
    temporary: Option<(OpMode, Interval, Seconds)>,
    mobile_period: Seconds,
    mobile_session: u32,
    test: TestMode,
    status: BatteryStatus,
    _cfg: PhantomData<C>,
}

impl<'a, C: NodeCfg> Default for Scheduler<'a, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, C: NodeCfg> Scheduler<'a, C> {
    /// An empty scheduler
    pub const fn new() -> Self {
        Self {
            groups: Vec::new(),
            completions: None,
            initialized: false,
            now: 0,
            op_mode: OpMode::Normal,
            temporary: None,
            mobile_period: 60,
            mobile_session: 0,
            test: TestMode::Off,
            status: BatteryStatus::NORMAL,
            _cfg: PhantomData,
        }
    }

    /// Receive hardware completions from `rx`
    pub fn set_completions(&mut self, rx: Receiver<'a, C::Mutex, Completion, COMPLETIONS>) {
        self.completions = Some(rx);
    }

    /// Register a group and its sensors, in polling order
    pub fn add_group<I>(&mut self, config: &'a GroupConfig, sensors: I) -> Result<u8, SchedError>
    where
        I: IntoIterator<Item = &'a mut dyn Sensor>,
    {
        let mut slot = GroupSlot {
            config,
            state: GroupState::default(),
            sensors: Vec::new(),
        };
        for sensor in sensors {
            let config = sensor.config();
            slot.sensors
                .push(SensorSlot {
                    sensor,
                    config,
                    state: SensorState::default(),
                })
                .map_err(|_| SchedError::Full)?;
        }
        let id = self.groups.len() as u8;
        self.groups.push(slot).map_err(|_| SchedError::Full)?;
        Ok(id)
    }

    /// Configure every group against `storage`, and run the boot-time hooks
    ///
    /// Groups are present if their product mask intersects the configured
    /// products, sensors if their mask intersects the configured sensors. A
    /// group left with no sensors is not configured at all.
    pub fn init(&mut self, storage: &Storage, battery: &mut Battery, power: &mut dyn PowerControl, now: Seconds) {
        let status = self.status;
        for (gi, g) in self.groups.iter_mut().enumerate() {
            let cfg = g.config;
            g.state = GroupState::default();
            g.state.configured = (cfg.product & storage.products) != 0;
            if !g.state.configured {
                continue;
            }

            g.state.repeat_override = match repeat_override(&storage.sensor_params, cfg.name) {
                Ok(v) => v,
                Err(_e) => {
                    node_warn!("sched: bad sensor parameters for {=str}", cfg.name);
                    None
                }
            };

            if !cfg.sense_at_boot {
                g.state.last_repeated = Interval::at(now);
            }

            match cfg.power {
                Some(param) => power.set(param, false),
                None => g.state.powered_on = true,
            }

            if cfg.poll_ms.is_some() && cfg.poll_continuously {
                g.state.polling = true;
            }
            g.state.settling_seconds = min_settling(cfg.settling_seconds, cfg.poll_ms);

            let mut configured = 0;
            for (si, s) in g.sensors.iter_mut().enumerate() {
                s.state = SensorState::default();
                s.state.configured = (s.config.mask & storage.sensors) != 0;
                if !s.state.configured {
                    continue;
                }
                configured += 1;
                s.config.settling_seconds = min_settling(s.config.settling_seconds, s.config.poll_ms);
                if s.config.poll_ms.is_some() && s.config.poll_continuously {
                    s.state.polling = true;
                }
                let mut ctx = SensorCtx {
                    now,
                    id: SensorId {
                        group: gi as u8,
                        index: si as u8,
                    },
                    status,
                    battery: &mut *battery,
                };
                if !s.sensor.init_once(&mut ctx) {
                    node_warn!("sched: {=str} init failed", s.config.name);
                    s.state.init_failures += 1;
                }
            }

            if configured == 0 {
                g.state.configured = false;
            }
        }
        self.initialized = true;
    }

    /// One scheduler tick
    pub fn poll(&mut self, env: &mut SchedEnv<'_>) {
        // Nothing is measured until readings can be stamped with a location
        if !env.gps_ready {
            return;
        }
        if !self.initialized {
            self.init(env.storage, env.battery, env.power, env.now);
        }

        self.now = env.now;
        let mode = self.op_mode(env.battery);
        self.status = env.battery.status(mode);
        self.drain_completions(env);
        self.enforce_deadlines(env);

        for gi in 0..self.groups.len() {
            self.poll_group(env, gi);
        }

        if self.test == TestMode::Requested && !self.groups.iter().any(|g| g.state.processing) {
            node_info!("sched: sensor test active");
            self.test = TestMode::Active;
        }
    }

    fn poll_group(&mut self, env: &mut SchedEnv<'_>, gi: usize) {
        let testing = self.test == TestMode::Active;
        let op_mode = self.op_mode(env.battery);
        let status = self.status;
        {
            let g = &self.groups[gi];
            if !g.state.configured || (testing && !g.state.tested) {
                return;
            }
        }

        if !self.groups[gi].state.processing && !self.groups[gi].state.settling {
            if !self.eligible(env, gi, op_mode) {
                return;
            }
            self.start_group(env, gi);
        }

        let g = &mut self.groups[gi];
        let cfg = g.config;

        if g.state.polling || g.sensors.iter().any(|s| s.state.polling) {
            Self::poll_sensors(env, status, gi, g);
        }

        if g.state.processing && g.state.settling {
            if g.state.settling_seconds != 0 && g.state.settled_at.should_suppress(env.now, g.state.settling_seconds) {
                return;
            }
            g.state.settling = false;
            node_debug!("sched: {=str} settled", cfg.name);
            if cfg.poll_ms.is_some() && !cfg.poll_continuously && !cfg.poll_during_settling {
                g.state.polling = true;
            }
            for (si, s) in g.sensors.iter_mut().enumerate() {
                if !s.state.configured {
                    continue;
                }
                let mut ctx = sensor_ctx(env, status, gi, si);
                s.sensor.done_group_settling(&mut ctx);
            }
        }

        if g.state.processing && !g.state.settling {
            Self::process_sensors(env, status, gi, g, testing);
        }

        let pending = g
            .sensors
            .iter()
            .filter(|s| s.state.configured && !s.state.completed && (!testing || s.state.tested))
            .count();
        if pending == 0 && g.state.processing {
            Self::finish_group(env, status, gi, g, op_mode);
        }
    }

    /// Can this idle group start a round now?
    fn eligible(&mut self, env: &mut SchedEnv<'_>, gi: usize, op_mode: OpMode) -> bool {
        let testing = self.test == TestMode::Active;
        if self.test == TestMode::Requested {
            return false;
        }

        let any_processing = self.groups.iter().any(|g| g.state.configured && g.state.processing);
        let any_exclusive = self.any_exclusive_busy();
        let any_power_exclusive = self
            .groups
            .iter()
            .any(|g| g.state.configured && g.config.power.is_some() && g.config.power_exclusive && g.state.powered_on);
        let any_twi = self
            .groups
            .iter()
            .any(|g| g.state.configured && g.state.processing && g.config.twi_exclusive);
        let repeat = self.repeat_seconds(gi);

        let g = &mut self.groups[gi];
        let cfg = g.config;

        if !testing {
            if let Some(skip) = cfg.skip {
                if skip(op_mode) {
                    return false;
                }
            }
        }

        // A group whose readings are all still waiting to go out would only
        // measure the same thing again
        let mut configured = 0;
        let mut all_waiting = true;
        for s in g.sensors.iter().filter(|s| s.state.configured) {
            configured += 1;
            if !s.sensor.upload_needed() {
                all_waiting = false;
                break;
            }
        }
        if configured == 0 {
            g.state.configured = false;
            return false;
        }
        if all_waiting && !testing {
            return false;
        }

        if cfg.exclusive {
            let comm_busy = env.storage.oneshot_minutes != 0 && env.comm_active;
            if !testing && (any_processing || comm_busy) {
                return false;
            }
        } else if !testing && any_exclusive {
            return false;
        }

        if cfg.power_exclusive && any_power_exclusive && !testing {
            return false;
        }
        if cfg.twi_exclusive && any_twi {
            return false;
        }

        let uart_free = env.uart.owner() == UartOwner::None;
        if cfg.uart_required && !uart_free {
            return false;
        }
        if env.uart_switching && cfg.uart_requested && !uart_free {
            return false;
        }

        if !self.status.intersects(cfg.battery) {
            return false;
        }
        if !cfg.comm.contains(&env.comm_mode) {
            return false;
        }

        let g = &mut self.groups[gi];
        if !testing && g.state.last_repeated.should_suppress_consistently(env.now, repeat) {
            return false;
        }
        true
    }

    fn start_group(&mut self, env: &mut SchedEnv<'_>, gi: usize) {
        let status = self.status;
        let g = &mut self.groups[gi];
        let cfg = g.config;
        node_debug!("sched: {=str} starting", cfg.name);

        for s in g.sensors.iter_mut().filter(|s| s.state.configured) {
            s.state.settling = false;
            s.state.processing = false;
            s.state.completed = false;
            s.state.measure_started = None;
        }
        g.state.processing = true;

        if let Some(param) = cfg.power {
            env.power.set(param, true);
            g.state.powered_on = true;
        }

        let owner = UartOwner::Sensor(gi as u8);
        if cfg.uart_required || (env.uart_switching && cfg.uart_requested) {
            env.uart.select(owner);
            g.state.uart_held = true;
        }

        for (si, s) in g.sensors.iter_mut().enumerate() {
            if !s.state.configured {
                continue;
            }
            let mut ctx = sensor_ctx(env, status, gi, si);
            if s.sensor.init_power(&mut ctx) {
                s.state.init_failures = 0;
            } else {
                node_warn!("sched: {=str} power-on init failed", s.config.name);
                s.state.init_failures += 1;
            }
        }

        g.state.settled_at = Interval::at(env.now);
        g.state.settling = true;

        if cfg.poll_ms.is_some() && !cfg.poll_continuously && cfg.poll_during_settling {
            g.state.polling = true;
        }
        for s in g.sensors.iter_mut().filter(|s| s.state.configured) {
            if s.config.poll_ms.is_some() && !s.config.poll_continuously && s.config.poll_during_settling {
                s.state.polling = true;
            }
        }
    }

    fn poll_sensors(env: &mut SchedEnv<'_>, status: BatteryStatus, gi: usize, g: &mut GroupSlot<'_>) {
        let group_polling = g.state.polling;
        for (si, s) in g.sensors.iter_mut().enumerate() {
            if !s.state.configured || !(group_polling || s.state.polling) {
                continue;
            }
            let mut ctx = sensor_ctx(env, status, gi, si);
            let outcome = s.sensor.poll(&mut ctx);
            if s.state.processing && !s.state.completed {
                settle_outcome(env.stats, s, outcome);
            }
        }
    }

    fn process_sensors(
        env: &mut SchedEnv<'_>,
        status: BatteryStatus,
        gi: usize,
        g: &mut GroupSlot<'_>,
        testing: bool,
    ) {
        for (si, s) in g.sensors.iter_mut().enumerate() {
            if !s.state.configured || (testing && !s.state.tested) {
                continue;
            }

            if !s.state.processing && !s.state.completed {
                s.state.processing = true;
                s.state.settling = true;
                s.state.settled_at = env.now;
                if s.state.tested {
                    node_info!("sched: testing {=str}", s.config.name);
                }
            }

            if s.state.processing && s.state.settling {
                let mut settled = Interval::at(s.state.settled_at);
                if s.config.settling_seconds != 0 && settled.should_suppress(env.now, s.config.settling_seconds) {
                    break;
                }
                s.state.settling = false;
                if s.config.poll_ms.is_some() && !s.config.poll_continuously && !s.config.poll_during_settling {
                    s.state.polling = true;
                }
                let mut ctx = sensor_ctx(env, status, gi, si);
                s.sensor.done_settling(&mut ctx);
            }

            if s.state.processing && !s.state.completed && !s.state.settling {
                if s.state.measure_started.is_none() {
                    s.state.measure_started = Some(env.now);
                }
                let mut ctx = sensor_ctx(env, status, gi, si);
                let outcome = s.sensor.measure(&mut ctx);
                settle_outcome(env.stats, s, outcome);
            }

            if s.state.processing && !s.state.completed {
                break;
            }
        }
    }

    fn finish_group(env: &mut SchedEnv<'_>, status: BatteryStatus, gi: usize, g: &mut GroupSlot<'_>, op_mode: OpMode) {
        let cfg = g.config;

        if cfg.poll_ms.is_some() && !cfg.poll_continuously {
            g.state.polling = false;
        }
        for (si, s) in g.sensors.iter_mut().enumerate() {
            if !s.state.configured {
                continue;
            }
            if s.config.poll_ms.is_some() && !s.config.poll_continuously {
                s.state.polling = false;
            }
            let mut ctx = sensor_ctx(env, status, gi, si);
            if s.sensor.term_power(&mut ctx) {
                s.state.term_failures = 0;
            } else {
                s.state.term_failures += 1;
            }
        }

        if g.state.uart_held {
            env.uart.release(UartOwner::Sensor(gi as u8));
            g.state.uart_held = false;
        }

        if let Some(param) = cfg.power {
            env.power.set(param, false);
            g.state.powered_on = false;
        }

        g.state.processing = false;
        g.state.settling = false;

        let mut configured = 0;
        for s in g.sensors.iter_mut().filter(|s| s.state.configured) {
            if s.state.deconfigure && op_mode != OpMode::Burn {
                node_warn!("sched: deconfiguring {=str}", s.config.name);
                s.state.configured = false;
            } else {
                configured += 1;
            }
        }
        if configured == 0 || g.state.deconfigure {
            node_warn!("sched: deconfiguring {=str}", cfg.name);
            g.state.configured = false;
        }
        node_debug!("sched: {=str} completed", cfg.name);
    }

    fn drain_completions(&mut self, env: &mut SchedEnv<'_>) {
        let Some(rx) = self.completions.as_ref() else {
            return;
        };
        while let Ok(c) = rx.try_receive() {
            let Some(s) = self
                .groups
                .get_mut(c.id.group as usize)
                .and_then(|g| g.sensors.get_mut(c.id.index as usize))
            else {
                node_warn!("sched: completion for unknown sensor");
                continue;
            };
            // A completion for a round that already ended is stale
            if s.state.configured && s.state.processing && !s.state.completed {
                settle_outcome(env.stats, s, c.outcome);
            }
        }
    }

    fn enforce_deadlines(&mut self, env: &mut SchedEnv<'_>) {
        for g in self.groups.iter_mut().filter(|g| g.state.configured && g.state.processing) {
            for s in g.sensors.iter_mut() {
                let Some(started) = s.state.measure_started else {
                    continue;
                };
                if !s.state.completed && env.now.wrapping_sub(started) > C::MEASURE_DEADLINE_SECONDS {
                    node_error!("sched: {=str} measurement timed out", s.config.name);
                    settle_outcome(env.stats, s, Measure::Failed);
                }
            }
        }
    }

    /// Mark a sensor's measurement round as done
    pub fn measurement_completed(&mut self, id: SensorId) {
        if let Some(s) = self.sensor_mut(id) {
            s.state.complete();
        }
    }

    /// Mark a sensor as broken; it is left alone once its group powers off
    ///
    /// Ignored in burn-in mode, where every sensor keeps being exercised.
    pub fn unconfigure(&mut self, id: SensorId) {
        let burn = self.op_mode == OpMode::Burn;
        if let Some(s) = self.sensor_mut(id) {
            s.state.complete();
            if burn {
                node_info!("sched: would have deconfigured {=str}", s.config.name);
            } else {
                s.state.deconfigure = true;
            }
        }
    }

    /// Complete every sensor in the named group. Returns whether any were
    /// still going.
    pub fn group_completed(&mut self, name: &str) -> bool {
        let Some(g) = self.group_mut(name) else {
            return false;
        };
        g.state.polling = false;
        let mut any = false;
        for s in g.sensors.iter_mut() {
            if s.state.configured && !s.state.completed {
                s.state.complete();
                any = true;
            }
        }
        any
    }

    /// Make every group but the GPS due now
    pub fn schedule_now(&mut self) -> bool {
        if !self.initialized {
            node_warn!("sched: not yet initialized");
            return false;
        }
        for g in self.groups.iter_mut().filter(|g| g.state.configured) {
            if g.config.name != GPS_GROUP {
                g.state.last_repeated.clear();
            }
        }
        node_info!("sched: timings accelerated");
        true
    }

    /// Make the named group due now
    pub fn group_schedule_now(&mut self, name: &str) -> Result<(), SchedError> {
        let g = self.group_mut(name).ok_or(SchedError::NotFound)?;
        g.state.last_repeated.clear();
        Ok(())
    }

    /// Measure only the named sensor, continuously, once running groups finish.
    /// An empty or unknown name leaves test mode.
    pub fn test_sensor(&mut self, name: &str) -> Result<(), SchedError> {
        let mut found = false;
        for g in self.groups.iter_mut() {
            g.state.tested = false;
            for s in g.sensors.iter_mut() {
                s.state.tested = !name.is_empty() && s.config.name == name;
                if s.state.tested {
                    g.state.tested = true;
                    found = true;
                }
            }
        }
        if found {
            self.test = TestMode::Requested;
            Ok(())
        } else {
            self.test = TestMode::Off;
            if name.is_empty() {
                Ok(())
            } else {
                Err(SchedError::NotFound)
            }
        }
    }

    /// Is a sensor test running?
    pub fn test_mode(&self) -> bool {
        self.test == TestMode::Active
    }

    /// Does any sensor have a reading waiting to be uploaded?
    pub fn any_upload_needed(&self) -> bool {
        if !self.initialized || self.test == TestMode::Active {
            return false;
        }
        self.configured_sensors().any(|s| s.sensor.upload_needed())
    }

    /// Is an exclusive group in the middle of a round?
    pub fn any_exclusive_busy(&self) -> bool {
        if !self.initialized || self.test == TestMode::Active {
            return false;
        }
        self.groups
            .iter()
            .any(|g| g.state.configured && g.state.processing && g.config.exclusive)
    }

    /// Is the named group's power on?
    pub fn group_powered_on(&self, name: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.config.name == name && g.state.powered_on)
    }

    /// Seconds between rounds of the given group, at the current battery status
    pub fn group_repeat_seconds(&self, name: &str) -> Option<Seconds> {
        let gi = self.groups.iter().position(|g| g.config.name == name)?;
        Some(self.repeat_seconds(gi))
    }

    fn repeat_seconds(&self, gi: usize) -> Seconds {
        let g = &self.groups[gi];
        if let Some(over) = g.state.repeat_override {
            if over != 0 {
                return over;
            }
        }
        let seconds = match g.config.repeat_for(self.status) {
            Some(s) => s,
            None => {
                node_warn!("sched: {=str} has no repeat for this battery status", g.config.name);
                0
            }
        };
        if self.status == BatteryStatus::TEST {
            seconds / 2
        } else {
            seconds
        }
    }

    /// Change the operating mode
    ///
    /// Mobile mode is refused if the position is statically configured, and
    /// entering it starts a new mobile session.
    pub fn set_op_mode(&mut self, mode: OpMode, storage: &Storage) -> Result<ModeChange, SchedError> {
        let mut change = ModeChange::Plain;
        if mode == OpMode::Mobile && self.op_mode != OpMode::Mobile {
            if storage.static_gps.is_some() {
                node_warn!("sched: mobile mode doesn't make sense with a static location");
                return Err(SchedError::StaticLocation);
            }
            self.mobile_session = self.mobile_session.wrapping_add(1);
            if self.group_schedule_now(GPS_GROUP).is_err() {
                node_debug!("sched: no gps group");
            }
            change = ModeChange::NewMobileSession;
        }
        self.op_mode = mode;
        Ok(change)
    }

    /// Use `mode` for the next `seconds`, or stop doing so with zero
    pub fn set_temporary_op_mode(&mut self, mode: OpMode, seconds: Seconds, now: Seconds) {
        self.temporary = match seconds {
            0 => None,
            s => Some((mode, Interval::at(now), s)),
        };
    }

    /// Operating mode in effect; a dead battery always means normal
    pub fn op_mode(&self, battery: &Battery) -> OpMode {
        if battery.soc() < 10.0 {
            return OpMode::Normal;
        }
        if let Some((mode, since, secs)) = self.temporary {
            if since.would_suppress(self.now, secs) {
                return mode;
            }
        }
        self.op_mode
    }

    /// Operating mode as configured
    pub fn configured_op_mode(&self) -> OpMode {
        self.op_mode
    }

    /// Battery status as of the last tick
    pub fn status(&self) -> BatteryStatus {
        self.status
    }

    /// Upload period in mobile mode
    pub fn mobile_period(&self) -> Seconds {
        self.mobile_period
    }

    /// Set the upload period in mobile mode; zero means as fast as possible
    pub fn set_mobile_period(&mut self, seconds: Seconds) {
        self.mobile_period = seconds;
    }

    /// Drive session number, bumped every time mobile mode is entered
    pub fn mobile_session(&self) -> u32 {
        self.mobile_session
    }

    /// Log the state of every group and sensor
    pub fn show_state(&self, now: Seconds) {
        for (gi, g) in self.groups.iter().enumerate() {
            if !g.state.configured {
                node_info!("sched: {=str} not configured", g.config.name);
                continue;
            }
            let phase = if g.state.settling {
                "settling"
            } else if g.state.processing {
                "processing"
            } else {
                "idle"
            };
            node_info!(
                "sched: {=str} {=str} power {=bool} next in {=i64}s",
                g.config.name,
                phase,
                g.state.powered_on,
                g.state.last_repeated.remaining(now, self.repeat_seconds(gi))
            );
            for s in g.sensors.iter().filter(|s| s.state.configured) {
                node_info!(
                    "sched:   {=str} done {=bool} failures {=u16}/{=u16}/{=u16}",
                    s.config.name,
                    s.state.completed,
                    s.state.init_failures,
                    s.state.measure_failures,
                    s.state.term_failures
                );
            }
        }
    }

    /// Render every configured sensor's latest value into `out`, one per line
    pub fn show_values(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        for s in self.configured_sensors() {
            s.sensor.show_value(out)?;
            out.write_char('\n')?;
        }
        Ok(())
    }

    fn configured_sensors(&self) -> impl Iterator<Item = &SensorSlot<'a>> {
        self.groups
            .iter()
            .filter(|g| g.state.configured)
            .flat_map(|g| g.sensors.iter())
            .filter(|s| s.state.configured)
    }

    fn sensor_mut(&mut self, id: SensorId) -> Option<&mut SensorSlot<'a>> {
        self.groups
            .get_mut(id.group as usize)?
            .sensors
            .get_mut(id.index as usize)
    }

    fn group_mut(&mut self, name: &str) -> Option<&mut GroupSlot<'a>> {
        self.groups.iter_mut().find(|g| g.config.name == name)
    }
}

impl<'a, C: NodeCfg> ReportSource for Scheduler<'a, C> {
    fn fill_report(&self, report: &mut Report) -> bool {
        let mut any = false;
        for s in self.configured_sensors().filter(|s| s.sensor.upload_needed()) {
            s.sensor.report(report);
            any = true;
        }
        any
    }

    fn report_sent(&mut self) {
        for g in self.groups.iter_mut().filter(|g| g.state.configured) {
            for s in g.sensors.iter_mut().filter(|s| s.state.configured) {
                if s.sensor.upload_needed() {
                    s.sensor.report_sent();
                }
            }
        }
    }
}

fn sensor_ctx<'e>(env: &'e mut SchedEnv<'_>, status: BatteryStatus, gi: usize, si: usize) -> SensorCtx<'e> {
    SensorCtx {
        now: env.now,
        id: SensorId {
            group: gi as u8,
            index: si as u8,
        },
        status,
        battery: &mut *env.battery,
    }
}

fn settle_outcome(stats: &mut Stats, s: &mut SensorSlot<'_>, outcome: Measure) {
    match outcome {
        Measure::Pending => {}
        Measure::Done => {
            node_debug!("sched: {=str} measured", s.config.name);
            s.state.complete();
        }
        Measure::Failed => {
            stats.errors_sensor = stats.errors_sensor.wrapping_add(1);
            s.state.measure_failures = s.state.measure_failures.wrapping_add(1);
            s.state.complete();
        }
        Measure::Unconfigure => {
            stats.errors_sensor = stats.errors_sensor.wrapping_add(1);
            s.state.complete();
            s.state.deconfigure = true;
        }
    }
}

#[cfg(test)]
mod test;
