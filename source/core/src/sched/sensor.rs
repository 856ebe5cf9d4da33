//! The sensor capability interface
//!
//! A physical sensor driver implements [Sensor]. The scheduler owns the
//! driver for its whole life and is the only caller of its methods; drivers
//! never call back into the scheduler; they report progress with the
//! [Measure] they return, or by posting a [Completion] from interrupt
//! context.

use core::fmt;

use crate::{
    battery::{Battery, BatteryStatus},
    wire::Report,
    Seconds,
};

/// Where a sensor lives in the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct SensorId {
    /// Index of the group
    pub group: u8,
    /// Index within the group
    pub index: u8,
}

/// Progress of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Measure {
    /// Still going; ask again next tick, or wait for a [Completion]
    Pending,
    /// This round is done
    Done,
    /// This round failed, but the sensor is otherwise fine
    Failed,
    /// The sensor is broken or missing and should be left alone from now on
    Unconfigure,
}

/// A hardware transaction finished, posted by whoever saw it finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Completion {
    /// The sensor whose transaction it was
    pub id: SensorId,
    /// How it went
    pub outcome: Measure,
}

/// Static description of a sensor
#[derive(Debug, Clone, Copy)]
pub struct SensorConfig {
    /// For logs and status output
    pub name: &'static str,
    /// Present if this mask intersects the configured sensor mask
    pub mask: u32,
    /// Time between the start of processing and the first `measure`
    pub settling_seconds: Seconds,
    /// Period of the sensor's own poller, if it has one
    pub poll_ms: Option<u32>,
    /// Keep polling through settling, rather than starting after it
    pub poll_during_settling: bool,
    /// Poll whenever configured, regardless of processing
    pub poll_continuously: bool,
}

impl SensorConfig {
    /// A sensor with no settling and no poller
    pub const fn new(name: &'static str, mask: u32) -> Self {
        Self {
            name,
            mask,
            settling_seconds: 0,
            poll_ms: None,
            poll_during_settling: false,
            poll_continuously: false,
        }
    }
}

/// What a driver gets to see while it's being called
pub struct SensorCtx<'a> {
    /// Current time
    pub now: Seconds,
    /// Which sensor is being called
    pub id: SensorId,
    /// Battery band at the start of this tick
    pub status: BatteryStatus,
    /// Battery state, for the fuel gauge
    pub battery: &'a mut Battery,
}

/// A physical sensor driver
pub trait Sensor {
    /// Static description
    fn config(&self) -> SensorConfig;

    /// Called once at boot. Returns false on failure.
    fn init_once(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        true
    }

    /// Called after the group's power comes on. Returns false on failure.
    fn init_power(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        true
    }

    /// Called before the group's power goes off. Returns false on failure.
    fn term_power(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        true
    }

    /// Start, or continue, a measurement
    ///
    /// Called every tick until it returns something other than
    /// [Measure::Pending], or a [Completion] arrives for this sensor.
    fn measure(&mut self, ctx: &mut SensorCtx<'_>) -> Measure;

    /// Periodic sampling while polling is enabled
    fn poll(&mut self, _ctx: &mut SensorCtx<'_>) -> Measure {
        Measure::Pending
    }

    /// Is there a reading waiting to be uploaded?
    fn upload_needed(&self) -> bool {
        false
    }

    /// Render the latest reading, for status output
    fn show_value(&self, _out: &mut dyn fmt::Write) -> fmt::Result {
        Ok(())
    }

    /// This sensor's own settling is over
    fn done_settling(&mut self, _ctx: &mut SensorCtx<'_>) {}

    /// The group's settling is over
    fn done_group_settling(&mut self, _ctx: &mut SensorCtx<'_>) {}

    /// Copy the waiting reading into `report`
    fn report(&self, _report: &mut Report) {}

    /// The reading was handed to a transport
    fn report_sent(&mut self) {}
}

/// Scheduler bookkeeping for one sensor
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SensorState {
    pub(crate) configured: bool,
    pub(crate) settling: bool,
    pub(crate) processing: bool,
    pub(crate) completed: bool,
    pub(crate) polling: bool,
    pub(crate) deconfigure: bool,
    pub(crate) tested: bool,
    pub(crate) settled_at: Seconds,
    pub(crate) measure_started: Option<Seconds>,
    pub(crate) init_failures: u16,
    pub(crate) term_failures: u16,
    pub(crate) measure_failures: u16,
}

impl SensorState {
    /// Mark this round done
    pub(crate) fn complete(&mut self) {
        self.completed = true;
        self.polling = false;
        self.measure_started = None;
    }
}
