use std::{cell::RefCell, collections::VecDeque, rc::Rc, vec::Vec};

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};

use super::*;
use crate::config::Location;

static HOURLY: [Repeat; 1] = [Repeat {
    status: BatteryStatus::ALL,
    seconds: 3600,
}];

static MINUTELY: [Repeat; 1] = [Repeat {
    status: BatteryStatus::ALL,
    seconds: 60,
}];

#[derive(Default)]
struct Log {
    calls: Vec<&'static str>,
    results: VecDeque<Measure>,
    stuck: bool,
    upload: bool,
}

impl Log {
    fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| **c == call).count()
    }
}

struct Probe {
    config: SensorConfig,
    log: Rc<RefCell<Log>>,
}

fn probe(name: &'static str) -> (Probe, Rc<RefCell<Log>>) {
    let log = Rc::new(RefCell::new(Log::default()));
    let p = Probe {
        config: SensorConfig::new(name, 1),
        log: log.clone(),
    };
    (p, log)
}

impl Sensor for Probe {
    fn config(&self) -> SensorConfig {
        self.config
    }

    fn init_once(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        self.log.borrow_mut().calls.push("init_once");
        true
    }

    fn init_power(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        self.log.borrow_mut().calls.push("init_power");
        true
    }

    fn term_power(&mut self, _ctx: &mut SensorCtx<'_>) -> bool {
        self.log.borrow_mut().calls.push("term_power");
        true
    }

    fn done_settling(&mut self, _ctx: &mut SensorCtx<'_>) {
        self.log.borrow_mut().calls.push("done_settling");
    }

    fn measure(&mut self, _ctx: &mut SensorCtx<'_>) -> Measure {
        let mut log = self.log.borrow_mut();
        log.calls.push("measure");
        if log.stuck {
            return Measure::Pending;
        }
        log.results.pop_front().unwrap_or(Measure::Done)
    }

    fn upload_needed(&self) -> bool {
        self.log.borrow().upload
    }

    fn show_value(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        write!(out, "{} ok", self.config.name)
    }

    fn report(&self, report: &mut Report) {
        report.env_temp = Some(21.5);
    }

    fn report_sent(&mut self) {
        self.log.borrow_mut().upload = false;
    }
}

#[derive(Default)]
struct Power(Vec<(u8, bool)>);

impl Power {
    fn is_on(&self, param: u8) -> bool {
        self.0
            .iter()
            .rev()
            .find(|(p, _)| *p == param)
            .map_or(false, |(_, on)| *on)
    }

    fn ever_on(&self, param: u8) -> bool {
        self.0.iter().any(|(p, on)| *p == param && *on)
    }
}

impl PowerControl for Power {
    fn set(&mut self, param: u8, on: bool) {
        self.0.push((param, on));
    }
}

struct World {
    storage: Storage,
    stats: Stats,
    uart: Uart,
    battery: Battery,
    power: Power,
    comm_mode: CommMode,
    comm_active: bool,
    uart_switching: bool,
}

impl World {
    fn new() -> Self {
        Self {
            storage: Storage::default(),
            stats: Stats::new(),
            uart: Uart::new(),
            battery: Battery::new(),
            power: Power::default(),
            comm_mode: CommMode::None,
            comm_active: false,
            uart_switching: false,
        }
    }

    fn tick(&mut self, s: &mut Scheduler<'_>, now: Seconds) {
        let mut env = SchedEnv {
            now,
            storage: &self.storage,
            stats: &mut self.stats,
            uart: &mut self.uart,
            battery: &mut self.battery,
            power: &mut self.power,
            comm_mode: self.comm_mode,
            comm_active: self.comm_active,
            uart_switching: self.uart_switching,
            gps_ready: true,
        };
        s.poll(&mut env);
    }
}

fn at_boot(name: &'static str, repeat: &'static [Repeat]) -> GroupConfig {
    GroupConfig {
        sense_at_boot: true,
        ..GroupConfig::new(name, repeat)
    }
}

#[test]
fn sensors_run_in_order_then_power_goes_off() {
    let g = GroupConfig {
        power: Some(3),
        ..at_boot("g-air", &MINUTELY)
    };
    let (mut a, la) = probe("s-a");
    let (mut b, lb) = probe("s-b");
    la.borrow_mut().results.push_back(Measure::Pending);

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor, &mut b]).unwrap();

    w.tick(&mut s, 100);
    assert!(w.power.is_on(3));
    assert_eq!(la.borrow().count("measure"), 1);
    assert_eq!(lb.borrow().count("measure"), 0);

    w.tick(&mut s, 105);
    assert!(!w.power.is_on(3));
    assert_eq!(
        la.borrow().calls,
        ["init_once", "init_power", "done_settling", "measure", "measure", "term_power"]
    );
    assert_eq!(
        lb.borrow().calls,
        ["init_once", "init_power", "done_settling", "measure", "term_power"]
    );

    // next round keeps to the cadence of the first
    w.tick(&mut s, 130);
    assert_eq!(la.borrow().count("init_power"), 1);
    w.tick(&mut s, 160);
    assert_eq!(la.borrow().count("init_power"), 2);
}

#[test]
fn without_sense_at_boot_the_first_round_waits_a_period() {
    let g = GroupConfig::new("g-air", &MINUTELY);
    let (mut a, la) = probe("s-a");
    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 10);
    w.tick(&mut s, 69);
    assert_eq!(la.borrow().count("measure"), 0);
    w.tick(&mut s, 70);
    assert_eq!(la.borrow().count("measure"), 1);
}

#[test]
fn group_settling_delays_the_first_sensor() {
    let g = GroupConfig {
        settling_seconds: 20,
        ..at_boot("g-air", &HOURLY)
    };
    let (mut a, la) = probe("s-a");
    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 100);
    w.tick(&mut s, 119);
    assert_eq!(la.borrow().count("measure"), 0);
    w.tick(&mut s, 120);
    assert_eq!(la.borrow().count("measure"), 1);
}

#[test]
fn exclusive_group_holds_off_everyone_else() {
    let excl = GroupConfig {
        exclusive: true,
        ..at_boot("g-excl", &HOURLY)
    };
    let other = at_boot("g-other", &HOURLY);
    let (mut a, la) = probe("s-a");
    let (mut b, lb) = probe("s-b");
    la.borrow_mut().results.extend([Measure::Pending, Measure::Pending]);

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&excl, [&mut a as &mut dyn Sensor]).unwrap();
    s.add_group(&other, [&mut b as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    assert!(s.any_exclusive_busy());
    w.tick(&mut s, 1);
    assert_eq!(lb.borrow().count("measure"), 0);
    w.tick(&mut s, 2);
    assert!(!s.any_exclusive_busy());
    assert_eq!(lb.borrow().count("measure"), 1);
}

#[test]
fn exclusive_group_waits_for_others_and_for_the_transport() {
    let slow = at_boot("g-slow", &HOURLY);
    let excl = GroupConfig {
        exclusive: true,
        ..at_boot("g-excl", &HOURLY)
    };
    let (mut a, la) = probe("s-a");
    let (mut b, lb) = probe("s-b");
    la.borrow_mut().results.push_back(Measure::Pending);

    let mut w = World::new();
    w.storage.oneshot_minutes = 15;
    w.comm_active = true;
    let mut s = Scheduler::new();
    s.add_group(&slow, [&mut a as &mut dyn Sensor]).unwrap();
    s.add_group(&excl, [&mut b as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    assert_eq!(lb.borrow().count("measure"), 0);
    // slow finishes, but the oneshot transport is up
    w.tick(&mut s, 1);
    assert_eq!(la.borrow().count("term_power"), 1);
    assert_eq!(lb.borrow().count("measure"), 0);
    w.comm_active = false;
    w.tick(&mut s, 2);
    assert_eq!(lb.borrow().count("measure"), 1);
}

#[test]
fn power_exclusive_groups_never_share_power() {
    let first = GroupConfig {
        power: Some(1),
        power_exclusive: true,
        ..at_boot("g-first", &HOURLY)
    };
    let second = GroupConfig {
        power: Some(2),
        power_exclusive: true,
        ..at_boot("g-second", &HOURLY)
    };
    let (mut a, la) = probe("s-a");
    let (mut b, _lb) = probe("s-b");
    la.borrow_mut().results.extend([Measure::Pending, Measure::Pending]);

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&first, [&mut a as &mut dyn Sensor]).unwrap();
    s.add_group(&second, [&mut b as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    w.tick(&mut s, 1);
    assert!(w.power.is_on(1));
    assert!(!w.power.ever_on(2));
    w.tick(&mut s, 2);
    assert!(!w.power.is_on(1));
    assert!(w.power.ever_on(2));
    assert!(!s.group_powered_on("g-second"));
}

#[test]
fn stuck_measurement_is_failed_at_the_deadline() {
    let g = at_boot("g-air", &HOURLY);
    let (mut a, la) = probe("s-a");
    la.borrow_mut().stuck = true;

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    w.tick(&mut s, 120);
    assert_eq!(w.stats.errors_sensor, 0);
    assert_eq!(la.borrow().count("term_power"), 0);
    w.tick(&mut s, 121);
    assert_eq!(w.stats.errors_sensor, 1);
    assert_eq!(la.borrow().count("term_power"), 1);
}

#[test]
fn completion_from_the_channel_ends_the_measurement() {
    let chan: Channel<CriticalSectionRawMutex, Completion, COMPLETIONS> = Channel::new();
    let g = at_boot("g-air", &HOURLY);
    let (mut a, la) = probe("s-a");
    la.borrow_mut().stuck = true;

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.set_completions(chan.receiver());
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    chan.try_send(Completion {
        id: SensorId { group: 0, index: 0 },
        outcome: Measure::Done,
    })
    .unwrap();
    w.tick(&mut s, 1);
    assert_eq!(la.borrow().count("measure"), 1);
    assert_eq!(la.borrow().count("term_power"), 1);
    assert_eq!(w.stats.errors_sensor, 0);
}

#[test]
fn broken_sensor_is_dropped_after_its_round() {
    let g = at_boot("g-air", &MINUTELY);
    let (mut a, la) = probe("s-a");
    la.borrow_mut().results.push_back(Measure::Unconfigure);

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    assert_eq!(w.stats.errors_sensor, 1);
    w.tick(&mut s, 60);
    w.tick(&mut s, 120);
    assert_eq!(la.borrow().count("measure"), 1);
}

#[test]
fn unconfigure_is_ignored_in_burn_mode() {
    let g = at_boot("g-air", &MINUTELY);
    let (mut a, la) = probe("s-a");
    la.borrow_mut().stuck = true;

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();
    s.set_op_mode(OpMode::Burn, &w.storage).unwrap();

    w.tick(&mut s, 0);
    s.unconfigure(SensorId { group: 0, index: 0 });
    w.tick(&mut s, 1);
    assert_eq!(la.borrow().count("term_power"), 1);
    w.tick(&mut s, 60);
    assert_eq!(la.borrow().count("measure"), 2);
}

#[test]
fn unconfigure_drops_the_sensor_otherwise() {
    let g = at_boot("g-air", &MINUTELY);
    let (mut a, la) = probe("s-a");
    la.borrow_mut().stuck = true;

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    s.unconfigure(SensorId { group: 0, index: 0 });
    w.tick(&mut s, 1);
    w.tick(&mut s, 60);
    assert_eq!(la.borrow().count("measure"), 1);
}

#[test]
fn uart_required_group_waits_for_the_uart() {
    let g = GroupConfig {
        uart_required: true,
        ..at_boot("g-pms", &HOURLY)
    };
    let (mut a, la) = probe("s-pms");
    la.borrow_mut().results.push_back(Measure::Pending);

    let mut w = World::new();
    w.uart.select(UartOwner::Cell);
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    assert_eq!(la.borrow().count("init_power"), 0);

    w.uart.release(UartOwner::Cell);
    w.tick(&mut s, 1);
    assert_eq!(w.uart.owner(), UartOwner::Sensor(0));
    w.tick(&mut s, 2);
    assert_eq!(w.uart.owner(), UartOwner::None);
}

#[test]
fn readings_waiting_for_upload_are_not_remeasured() {
    let g = at_boot("g-air", &HOURLY);
    let (mut a, la) = probe("s-a");
    la.borrow_mut().upload = true;

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    assert_eq!(la.borrow().count("measure"), 0);
    assert!(s.any_upload_needed());

    let mut report = Report::default();
    assert!(s.fill_report(&mut report));
    assert_eq!(report.env_temp, Some(21.5));
    s.report_sent();
    assert!(!s.any_upload_needed());

    w.tick(&mut s, 1);
    assert_eq!(la.borrow().count("measure"), 1);
}

#[test]
fn battery_and_transport_gate_groups() {
    let g = GroupConfig {
        comm: &[CommMode::Fona],
        ..at_boot("g-geiger", &HOURLY)
    };
    let (mut a, la) = probe("s-geiger");

    let mut w = World::new();
    w.battery.set_soc(30.0);
    w.comm_mode = CommMode::Fona;
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();

    // warning isn't healthy
    w.tick(&mut s, 0);
    assert_eq!(la.borrow().count("measure"), 0);

    w.battery.set_soc(80.0);
    w.comm_mode = CommMode::Lora;
    w.tick(&mut s, 1);
    assert_eq!(la.borrow().count("measure"), 0);

    w.comm_mode = CommMode::Fona;
    w.tick(&mut s, 2);
    assert_eq!(la.borrow().count("measure"), 1);
}

#[test]
fn mobile_skip_predicate() {
    let g = GroupConfig {
        skip: Some(skip_when_mobile),
        ..at_boot("g-twi", &HOURLY)
    };
    let (mut a, la) = probe("s-twi");

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor]).unwrap();
    assert_eq!(s.set_op_mode(OpMode::Mobile, &w.storage), Ok(ModeChange::NewMobileSession));

    w.tick(&mut s, 0);
    assert_eq!(la.borrow().count("measure"), 0);
}

#[test]
fn repeat_follows_override_then_table() {
    let geiger = at_boot("g-geiger", &HOURLY);
    let air = at_boot("g-air", &HOURLY);
    let (mut a, _la) = probe("s-geiger");
    let (mut b, _lb) = probe("s-air");

    let mut w = World::new();
    w.storage.sensor_params = heapless::String::from("g-air.r=5");
    let mut s = Scheduler::new();
    s.add_group(&geiger, [&mut a as &mut dyn Sensor]).unwrap();
    s.add_group(&air, [&mut b as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 0);
    assert_eq!(s.group_repeat_seconds("g-geiger"), Some(3600));
    assert_eq!(s.group_repeat_seconds("g-air"), Some(300));
    assert_eq!(s.group_repeat_seconds("g-nope"), None);

    s.set_op_mode(OpMode::Test, &w.storage).unwrap();
    w.tick(&mut s, 1);
    assert_eq!(s.status(), BatteryStatus::TEST);
    assert_eq!(s.group_repeat_seconds("g-geiger"), Some(1800));
    assert_eq!(s.group_repeat_seconds("g-air"), Some(300));
}

#[test]
fn schedule_now_skips_the_gps() {
    let gps = GroupConfig::new(GPS_GROUP, &HOURLY);
    let air = GroupConfig::new("g-air", &HOURLY);
    let (mut a, la) = probe("s-gps");
    let (mut b, lb) = probe("s-air");

    let mut w = World::new();
    let mut s = Scheduler::new();
    assert!(!s.schedule_now());
    s.add_group(&gps, [&mut a as &mut dyn Sensor]).unwrap();
    s.add_group(&air, [&mut b as &mut dyn Sensor]).unwrap();

    w.tick(&mut s, 10);
    assert!(s.schedule_now());
    w.tick(&mut s, 11);
    assert_eq!(la.borrow().count("measure"), 0);
    assert_eq!(lb.borrow().count("measure"), 1);

    s.group_schedule_now(GPS_GROUP).unwrap();
    w.tick(&mut s, 12);
    assert_eq!(la.borrow().count("measure"), 1);
    assert_eq!(s.group_schedule_now("g-nope"), Err(SchedError::NotFound));
}

#[test]
fn mobile_mode_needs_a_moving_location() {
    let mut s: Scheduler<'_> = Scheduler::new();
    let mut storage = Storage::default();
    storage.static_gps = Some(Location {
        lat: 35.6,
        lon: 139.7,
        alt: 40.0,
    });
    assert_eq!(s.set_op_mode(OpMode::Mobile, &storage), Err(SchedError::StaticLocation));
    assert_eq!(s.configured_op_mode(), OpMode::Normal);

    storage.static_gps = None;
    assert_eq!(s.set_op_mode(OpMode::Mobile, &storage), Ok(ModeChange::NewMobileSession));
    assert_eq!(s.set_op_mode(OpMode::Mobile, &storage), Ok(ModeChange::Plain));
    assert_eq!(s.mobile_session(), 1);
}

#[test]
fn dead_battery_overrides_the_mode() {
    let mut s: Scheduler<'_> = Scheduler::new();
    let storage = Storage::default();
    s.set_op_mode(OpMode::Burn, &storage).unwrap();
    let mut battery = Battery::new();
    assert_eq!(s.op_mode(&battery), OpMode::Burn);
    battery.set_soc(5.0);
    assert_eq!(s.op_mode(&battery), OpMode::Normal);
}

#[test]
fn test_mode_runs_only_the_chosen_sensor() {
    let ga = at_boot("g-a", &HOURLY);
    let gb = at_boot("g-b", &HOURLY);
    let (mut a, la) = probe("s-a");
    let (mut b, lb) = probe("s-b");

    let mut w = World::new();
    let mut s = Scheduler::new();
    s.add_group(&ga, [&mut a as &mut dyn Sensor]).unwrap();
    s.add_group(&gb, [&mut b as &mut dyn Sensor]).unwrap();

    assert_eq!(s.test_sensor("s-nope"), Err(SchedError::NotFound));
    s.test_sensor("s-b").unwrap();
    w.tick(&mut s, 0);
    assert!(s.test_mode());
    w.tick(&mut s, 1);
    w.tick(&mut s, 2);
    assert_eq!(la.borrow().count("measure"), 0);
    assert_eq!(lb.borrow().count("measure"), 2);

    s.test_sensor("").unwrap();
    assert!(!s.test_mode());
}

#[test]
fn values_are_listed_per_sensor() {
    let g = at_boot("g-air", &HOURLY);
    let (mut a, _la) = probe("s-a");
    let (mut b, _lb) = probe("s-b");

    let mut w = World::new();
    w.storage.sensors = 0;
    let mut s = Scheduler::new();
    s.add_group(&g, [&mut a as &mut dyn Sensor, &mut b]).unwrap();
    w.tick(&mut s, 0);
    let mut out = std::string::String::new();
    s.show_values(&mut out).unwrap();
    assert_eq!(out, "");

    w.storage.sensors = u32::MAX;
    s.init(&w.storage, &mut w.battery, &mut w.power, 1);
    s.show_values(&mut out).unwrap();
    assert_eq!(out, "s-a ok\ns-b ok\n");
}
