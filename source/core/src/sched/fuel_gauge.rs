//! Battery fuel gauge
//!
//! Averages a few samples from a voltage/current monitor, derives a state
//! of charge, and feeds it to [Battery::set_soc](crate::battery::Battery::set_soc).
//! The first sample after every power-on reads stale registers and is
//! thrown away.

use core::fmt;

use crate::{battery::soc_from_voltage, wire::Report};

use super::sensor::{Measure, Sensor, SensorConfig, SensorCtx};

const SAMPLE_BINS: u16 = 5;
const MAX_READS: u16 = SAMPLE_BINS * 3;

/// One raw sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaugeSample {
    /// Load voltage, V
    pub voltage: f32,
    /// Current, mA, negative while charging
    pub current: f32,
}

/// The monitor chip
pub trait Gauge {
    /// Take a sample. `None` means the bus transaction failed.
    fn sample(&mut self) -> Option<GaugeSample>;
}

/// Averaged battery reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    /// Load voltage, V
    pub voltage: f32,
    /// Current, mA
    pub current: f32,
    /// State of charge, percent
    pub soc: f32,
}

/// Fuel gauge sensor driver
pub struct FuelGauge<G: Gauge> {
    gauge: G,
    config: SensorConfig,
    max_voltage: f32,
    first_sample: bool,
    samples: u16,
    reads: u16,
    voltage_sum: f32,
    current_sum: f32,
    reading: Option<BatteryReading>,
    unsent: bool,
}

impl<G: Gauge> FuelGauge<G> {
    /// A fuel gauge for a cell that reads 100% at `max_voltage`
    pub fn new(gauge: G, config: SensorConfig, max_voltage: f32) -> Self {
        Self {
            gauge,
            config,
            max_voltage,
            first_sample: true,
            samples: 0,
            reads: 0,
            voltage_sum: 0.0,
            current_sum: 0.0,
            reading: None,
            unsent: false,
        }
    }

    /// Latest averaged reading
    pub fn reading(&self) -> Option<BatteryReading> {
        self.reading
    }

    fn retry(&mut self) -> Measure {
        if self.reads >= MAX_READS {
            node_warn!("gauge: gave up after {=u16} reads", self.reads);
            self.clear();
            return Measure::Failed;
        }
        Measure::Pending
    }

    fn clear(&mut self) {
        self.first_sample = true;
        self.samples = 0;
        self.reads = 0;
        self.voltage_sum = 0.0;
        self.current_sum = 0.0;
    }
}

impl<G: Gauge> Sensor for FuelGauge<G> {
    fn config(&self) -> SensorConfig {
        self.config
    }

    fn init_power(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        self.clear();
        true
    }

    fn measure(&mut self, ctx: &mut SensorCtx<'_>) -> Measure {
        // Every attempt counts against the read budget, good or bad
        self.reads += 1;
        let Some(sample) = self.gauge.sample() else {
            node_warn!("gauge: read failed");
            return self.retry();
        };

        if self.first_sample && self.samples == 0 {
            self.first_sample = false;
            return Measure::Pending;
        }

        self.voltage_sum += sample.voltage;
        self.current_sum += sample.current;
        self.samples += 1;

        if self.samples < SAMPLE_BINS {
            return self.retry();
        }

        let n = f32::from(self.samples);
        let voltage = self.voltage_sum / n;
        let current = self.current_sum / n;
        let soc = soc_from_voltage(voltage, self.max_voltage);
        self.reading = Some(BatteryReading {
            voltage,
            current,
            soc,
        });
        self.unsent = true;
        ctx.battery.set_soc(soc);
        node_debug!("gauge: soc {=f32}", soc);
        self.clear();
        Measure::Done
    }

    fn upload_needed(&self) -> bool {
        self.unsent
    }

    fn show_value(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.reading {
            Some(r) => write!(out, "BAT {:.2}V {:.0}% {:.0}mA", r.voltage, r.soc, r.current),
            None => write!(out, "BAT (no reading)"),
        }
    }

    fn report(&self, report: &mut Report) {
        if let Some(r) = self.reading {
            report.bat_voltage = Some(r.voltage);
            report.bat_current = Some(r.current);
            report.bat_soc = Some(r.soc);
        }
    }

    fn report_sent(&mut self) {
        self.unsent = false;
    }
}
