//! Battery state of charge and status classification
//!
//! The fuel gauge feeds a state of charge in percent into [Battery::set_soc].
//! Everything else in the node asks [Battery::status] which coarse band the
//! node is in, and throttles work accordingly. Two sticky flags keep the
//! status from flapping around the low and full thresholds.

use core::ops::{BitAnd, BitOr};

/// Coarse battery status, as a bitmask so that configuration tables can
/// match several statuses at once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct BatteryStatus(u16);

impl BatteryStatus {
    /// Sensors disabled entirely
    pub const NO_SENSORS: Self = Self(0x0000);
    /// Charged past the full threshold
    pub const FULL: Self = Self(0x0001);
    /// Nothing to worry about
    pub const NORMAL: Self = Self(0x0002);
    /// Below 60%
    pub const LOW: Self = Self(0x0004);
    /// Below 40%
    pub const WARNING: Self = Self(0x0008);
    /// Below 20%, until recovered to 70%
    pub const EMERGENCY: Self = Self(0x0010);
    /// Below 10%
    pub const DEAD: Self = Self(0x0020);
    /// Test mode
    pub const TEST: Self = Self(0x0040);
    /// Mobile mode
    pub const MOBILE: Self = Self(0x0080);
    /// Burn-in mode
    pub const BURN: Self = Self(0x0100);

    /// Any status in which sensors should run normally
    pub const HEALTHY: Self =
        Self(Self::FULL.0 | Self::NORMAL.0 | Self::LOW.0 | Self::TEST.0 | Self::MOBILE.0 | Self::BURN.0);
    /// Anything but dead
    pub const NOT_DEAD: Self = Self(Self::HEALTHY.0 | Self::WARNING.0 | Self::EMERGENCY.0);
    /// Every status
    pub const ALL: Self = Self(Self::NOT_DEAD.0 | Self::DEAD.0);

    /// Does this mask share any status with `other`?
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Both masks, usable in constants
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for BatteryStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for BatteryStatus {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Operating mode of the node, which may override the battery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum OpMode {
    /// Battery driven behavior
    #[default]
    Normal,
    /// Burn-in, continuous measurement
    Burn,
    /// Bench test, faster schedules
    Test,
    /// Vehicle mounted
    Mobile,
    /// Bench test with sensors off
    TestDead,
}

const WARNING_SOC: f32 = 40.0;
const LOW_SOC: f32 = 60.0;
const DEAD_SOC: f32 = 10.0;
const EMERGENCY_ENTER_SOC: f32 = 20.0;
const EMERGENCY_EXIT_SOC: f32 = 70.0;
const FULL_ENTER_SOC: f32 = 110.0;
const FULL_EXIT_SOC: f32 = 100.0;

const MIN_VOLTAGE: f32 = 3.5;

/// Last known state of charge plus hysteresis flags
#[derive(Debug, Clone)]
pub struct Battery {
    soc: f32,
    recovery: bool,
    full_recovery: bool,
}

impl Default for Battery {
    fn default() -> Self {
        Self::new()
    }
}

impl Battery {
    /// State of charge unknown
    pub const fn new() -> Self {
        Self {
            soc: 0.0,
            recovery: false,
            full_recovery: true,
        }
    }

    /// Record a new state of charge, in percent
    pub fn set_soc(&mut self, soc: f32) {
        self.soc = if soc.is_finite() && soc > 0.0 { soc } else { 0.0 };
    }

    /// State of charge in percent; an unknown charge is reported as full
    pub fn soc(&self) -> f32 {
        if self.soc == 0.0 {
            100.0
        } else {
            self.soc
        }
    }

    /// Has a state of charge ever been recorded?
    pub fn is_known(&self) -> bool {
        self.soc != 0.0
    }

    /// Classify the current charge
    pub fn status(&mut self, mode: OpMode) -> BatteryStatus {
        let soc = self.soc;

        if soc != 0.0 && soc < DEAD_SOC {
            return BatteryStatus::DEAD;
        }

        match mode {
            OpMode::Burn => return BatteryStatus::BURN,
            OpMode::Test => return BatteryStatus::TEST,
            OpMode::Mobile => return BatteryStatus::MOBILE,
            OpMode::TestDead => return BatteryStatus::NO_SENSORS,
            OpMode::Normal => {}
        }

        if soc == 0.0 {
            return BatteryStatus::NORMAL;
        }

        if self.recovery {
            if soc < EMERGENCY_EXIT_SOC {
                return BatteryStatus::EMERGENCY;
            }
            node_info!("battery: recovered from emergency");
            self.recovery = false;
            return BatteryStatus::NORMAL;
        }

        if soc < EMERGENCY_ENTER_SOC {
            node_info!("battery: entering emergency recovery");
            self.recovery = true;
            return BatteryStatus::EMERGENCY;
        }

        if soc < WARNING_SOC {
            return BatteryStatus::WARNING;
        }

        if soc < LOW_SOC {
            return BatteryStatus::LOW;
        }

        if soc < FULL_EXIT_SOC {
            self.full_recovery = true;
            return BatteryStatus::NORMAL;
        }

        if self.full_recovery && soc < FULL_ENTER_SOC {
            return BatteryStatus::NORMAL;
        }

        self.full_recovery = false;
        BatteryStatus::FULL
    }
}

/// Estimate the state of charge of a LiPo cell from its voltage
///
/// Returns 0 at or below 3.5V and 100 at `max_v`. Above `max_v` the result
/// keeps climbing past 100, which is how a charger being plugged in shows up
/// as [BatteryStatus::FULL].
pub fn soc_from_voltage(v: f32, max_v: f32) -> f32 {
    if v <= MIN_VOLTAGE || max_v <= MIN_VOLTAGE {
        return 0.0;
    }
    (v - MIN_VOLTAGE) * 100.0 / (max_v - MIN_VOLTAGE)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_soc_reads_full_and_normal() {
        let mut b = Battery::new();
        assert_eq!(b.soc(), 100.0);
        assert!(!b.is_known());
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::NORMAL);
    }

    #[test]
    fn decreasing_soc_walks_every_band() {
        let mut b = Battery::new();
        let mut seen = std::vec::Vec::new();
        let mut soc = 115.0;
        while soc > 0.0 {
            b.set_soc(soc);
            let st = b.status(OpMode::Normal);
            if seen.last() != Some(&st) {
                seen.push(st);
            }
            soc -= 1.0;
        }
        assert_eq!(
            seen,
            [
                BatteryStatus::FULL,
                BatteryStatus::NORMAL,
                BatteryStatus::LOW,
                BatteryStatus::WARNING,
                BatteryStatus::EMERGENCY,
                BatteryStatus::DEAD,
            ]
        );
    }

    #[test]
    fn full_band_needs_110_to_enter_and_100_to_leave() {
        let mut b = Battery::new();
        b.set_soc(105.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::NORMAL);
        b.set_soc(110.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::FULL);
        b.set_soc(101.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::FULL);
        b.set_soc(99.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::NORMAL);
        b.set_soc(105.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::NORMAL);
    }

    #[test]
    fn emergency_holds_until_70() {
        let mut b = Battery::new();
        b.set_soc(15.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::EMERGENCY);
        for soc in [25.0, 45.0, 65.0, 69.9] {
            b.set_soc(soc);
            assert_eq!(b.status(OpMode::Normal), BatteryStatus::EMERGENCY);
        }
        b.set_soc(70.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::NORMAL);
        b.set_soc(65.0);
        assert_eq!(b.status(OpMode::Normal), BatteryStatus::LOW);
    }

    #[test]
    fn modes_override_all_but_dead() {
        let mut b = Battery::new();
        b.set_soc(50.0);
        assert_eq!(b.status(OpMode::Burn), BatteryStatus::BURN);
        assert_eq!(b.status(OpMode::Test), BatteryStatus::TEST);
        assert_eq!(b.status(OpMode::Mobile), BatteryStatus::MOBILE);
        assert_eq!(b.status(OpMode::TestDead), BatteryStatus::NO_SENSORS);
        b.set_soc(5.0);
        assert_eq!(b.status(OpMode::Mobile), BatteryStatus::DEAD);
    }

    #[test]
    fn voltage_boundaries() {
        assert_eq!(soc_from_voltage(3.5, 4.0), 0.0);
        assert_eq!(soc_from_voltage(3.2, 4.0), 0.0);
        assert_eq!(soc_from_voltage(4.0, 4.0), 100.0);
        assert!((soc_from_voltage(4.3, 4.0) - 160.0).abs() < 1e-3);
        assert_eq!(soc_from_voltage(3.75, 4.0), 50.0);
    }

    #[test]
    fn masks_compose() {
        assert!(BatteryStatus::HEALTHY.intersects(BatteryStatus::LOW));
        assert!(!BatteryStatus::HEALTHY.intersects(BatteryStatus::WARNING));
        assert!(BatteryStatus::NOT_DEAD.intersects(BatteryStatus::EMERGENCY));
        assert!(!BatteryStatus::NOT_DEAD.intersects(BatteryStatus::DEAD));
        assert!(!BatteryStatus::ALL.intersects(BatteryStatus::NO_SENSORS));
    }
}
