//! Sensor groups, which share a power domain

use crate::{
    battery::{BatteryStatus, OpMode},
    comm::CommMode,
    timer::Interval,
    Seconds,
};

/// One row of a repeat table
#[derive(Debug, Clone, Copy)]
pub struct Repeat {
    /// Battery statuses this row applies to
    pub status: BatteryStatus,
    /// Seconds between measurement rounds
    pub seconds: Seconds,
}

/// Static description of a group
#[derive(Debug, Clone, Copy)]
pub struct GroupConfig {
    /// For logs, status output and `name.r=` overrides
    pub name: &'static str,
    /// Present if this mask intersects the configured product mask
    pub product: u32,
    /// Runs only while the battery status intersects this
    pub battery: BatteryStatus,
    /// Runs only while one of these transports is selected
    pub comm: &'static [CommMode],
    /// Power switch parameter, for groups with switched power
    pub power: Option<u8>,
    /// Runs only while no other group is processing
    pub exclusive: bool,
    /// Never powered on together with another power exclusive group
    pub power_exclusive: bool,
    /// Never processing together with another TWI exclusive group
    pub twi_exclusive: bool,
    /// Time between power on and the first sensor starting
    pub settling_seconds: Seconds,
    /// Run the first round right away, rather than a full interval after boot
    pub sense_at_boot: bool,
    /// Rounds per battery status; the first matching row wins
    pub repeat: &'static [Repeat],
    /// Needs the shared UART, and can't run without it
    pub uart_required: bool,
    /// Wants the shared UART, if it can be switched away from the transports
    pub uart_requested: bool,
    /// Veto, checked before anything else
    pub skip: Option<fn(OpMode) -> bool>,
    /// Period of the group poller, if it has one
    pub poll_ms: Option<u32>,
    /// Keep the group poller running through settling
    pub poll_during_settling: bool,
    /// Group poller runs whenever configured
    pub poll_continuously: bool,
}

impl GroupConfig {
    /// A group that runs in every healthy status, on every transport
    pub const fn new(name: &'static str, repeat: &'static [Repeat]) -> Self {
        Self {
            name,
            product: u32::MAX,
            battery: BatteryStatus::HEALTHY,
            comm: &[CommMode::None, CommMode::Lora, CommMode::Fona],
            power: None,
            exclusive: false,
            power_exclusive: false,
            twi_exclusive: false,
            settling_seconds: 0,
            sense_at_boot: false,
            repeat,
            uart_required: false,
            uart_requested: false,
            skip: None,
            poll_ms: None,
            poll_during_settling: false,
            poll_continuously: false,
        }
    }

    /// Seconds between rounds for `status`, or `None` if no row matches
    pub fn repeat_for(&self, status: BatteryStatus) -> Option<Seconds> {
        self.repeat
            .iter()
            .find(|r| r.status.intersects(status))
            .map(|r| r.seconds)
    }
}

/// Skip predicate for groups that make no sense on the move
pub fn skip_when_mobile(mode: OpMode) -> bool {
    mode == OpMode::Mobile
}

/// Scheduler bookkeeping for one group
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GroupState {
    pub(crate) configured: bool,
    pub(crate) settling: bool,
    pub(crate) processing: bool,
    pub(crate) powered_on: bool,
    pub(crate) polling: bool,
    pub(crate) deconfigure: bool,
    pub(crate) tested: bool,
    pub(crate) uart_held: bool,
    pub(crate) settling_seconds: Seconds,
    pub(crate) settled_at: Interval,
    pub(crate) last_repeated: Interval,
    pub(crate) repeat_override: Option<Seconds>,
}

/// Stretch a settling period so that a poller gets at least one tick in
pub(crate) fn min_settling(settling: Seconds, poll_ms: Option<u32>) -> Seconds {
    match poll_ms {
        Some(ms) if settling != 0 => settling.max(ms / 1000 + 5),
        _ => settling,
    }
}
