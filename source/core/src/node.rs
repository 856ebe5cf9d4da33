//! The node
//!
//! [Node] owns every piece of node-wide state and runs one tick at a time:
//! sensors first, then the modem protocol, then transport management. A
//! measurement that completes in a tick can therefore go out in the same
//! tick.
//!
//! [Node::run] is the async driver. It ticks on a timer, and in between
//! feeds whatever the modem UART receives straight into the protocol, so
//! that command replies are answered without waiting for the next tick.

use embassy_time::{with_timeout, Duration, Instant};
use rand_core::RngCore;

use crate::{
    battery::{Battery, OpMode},
    comm::{Absent, Comm, Event, Links, Outlook},
    config::{DefaultCfg, NodeCfg, Storage, StorageBackend, WanMode},
    modem::{Modem, Tx},
    sched::{ModeChange, PowerControl, SchedEnv, SchedError, Scheduler},
    stats::Stats,
    uart::{Uart, UartOwner},
    Env, Error, ModemSerial, Seconds,
};

const RX_CHUNK: usize = 64;

/// Everything the node is made of
pub struct Node<'a, P, B, C = DefaultCfg>
where
    P: PowerControl,
    B: StorageBackend,
    C: NodeCfg,
{
    device_id: u32,
    storage: Storage,
    stats: Stats,
    uart: Uart,
    battery: Battery,
    sched: Scheduler<'a, C>,
    comm: Comm<C>,
    modem: Modem<C>,
    lora: Absent,
    power: P,
    backend: B,
    now: Seconds,
    restart: bool,
}

impl<'a, P, B, C> Node<'a, P, B, C>
where
    P: PowerControl,
    B: StorageBackend,
    C: NodeCfg,
{
    /// Assemble a node. `sched` should already have its groups added.
    pub fn new(device_id: u32, storage: Storage, sched: Scheduler<'a, C>, power: P, backend: B) -> Self {
        Self {
            device_id,
            storage,
            stats: Stats::new(),
            uart: Uart::new(),
            battery: Battery::new(),
            sched,
            comm: Comm::new(),
            modem: Modem::new(),
            lora: Absent,
            power,
            backend,
            now: 0,
            restart: false,
        }
    }

    /// Configure the sensors and arm the first transport select
    pub fn start(&mut self, now: Seconds, rng: &mut impl RngCore) {
        self.now = now;
        self.sched.init(&self.storage, &mut self.battery, &mut self.power, now);
        let outlook = self.outlook();
        self.with_comm(now, |comm, env, links, _| comm.init(env, links, &outlook, rng));
        node_info!("node: started, device {=u32}", self.device_id);
    }

    /// One tick
    pub fn step(&mut self, now: Seconds) {
        self.now = now;
        self.poll_sensors(now);
        self.service(now);

        let outlook = self.outlook();
        self.with_comm(now, |comm, env, links, sched| comm.poll(env, links, sched, &outlook));
        self.drain_events(now);

        if self.comm.take_restart() {
            self.restart = true;
        }
    }

    /// Run the modem protocol over whatever has been received so far
    pub fn service(&mut self, now: Seconds) {
        self.with_comm(now, |comm, env, links, _| {
            comm.prepare(env, links);
            links.cell.process(env);
        });
        self.drain_events(now);
    }

    /// Feed one byte from the shared UART
    pub fn received_byte(&mut self, byte: u8) {
        if self.uart.is_selected(UartOwner::Cell) {
            self.modem.received_byte(byte);
        }
    }

    /// Write everything the modem has queued
    pub async fn flush<S: ModemSerial>(&mut self, serial: &mut S) -> Result<(), Error<S::SerError>> {
        while let Some(tx) = self.modem.next_tx() {
            match tx {
                Tx::Command(cmd) => {
                    node_trace!("node: > {=str}", cmd.as_str());
                    serial.write(cmd.as_bytes()).await?;
                    serial.write(b"\r").await?;
                }
                Tx::Payload => serial.write(self.modem.payload()).await?,
            }
        }
        Ok(())
    }

    /// Run until a restart is requested
    ///
    /// Returns `Ok(())` when the node should be reset, which is up to the
    /// caller.
    pub async fn run<S, R>(&mut self, serial: &mut S, rng: &mut R) -> Result<(), Error<S::SerError>>
    where
        S: ModemSerial,
        R: RngCore,
    {
        let boot = Instant::now();
        let seconds = || boot.elapsed().as_secs() as Seconds;
        let mut buf = [0u8; RX_CHUNK];

        self.start(seconds(), rng);
        loop {
            self.step(seconds());
            self.flush(serial).await?;
            if self.take_restart() {
                node_warn!("node: restart requested");
                return Ok(());
            }

            let deadline = Instant::now() + self.tick_period();
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                if left == Duration::from_ticks(0) {
                    break;
                }
                match with_timeout(left, serial.read(&mut buf)).await {
                    Ok(Ok(n)) => {
                        for b in &buf[..n] {
                            self.received_byte(*b);
                        }
                        self.service(seconds());
                        self.flush(serial).await?;
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => break,
                }
            }
        }
    }

    /// Time until the next tick
    pub fn tick_period(&self) -> Duration {
        let fast = matches!(
            self.sched.op_mode(&self.battery),
            OpMode::Mobile | OpMode::Test | OpMode::Burn
        ) || self.sched.test_mode()
            || !self.comm.is_deselected();
        if fast {
            C::FAST_TICK
        } else {
            C::SLOW_TICK
        }
    }

    /// Change the operating mode
    pub fn set_op_mode(&mut self, mode: OpMode) -> Result<(), SchedError> {
        if self.sched.set_op_mode(mode, &self.storage)? == ModeChange::NewMobileSession {
            node_info!("node: mobile session {=u32}", self.sched.mobile_session());
            self.with_comm(self.now, |comm, env, links, _| {
                comm.gps_update(env.storage, links);
                comm.initiate_service_update();
            });
        }
        Ok(())
    }

    /// Has anything asked for the node to be reset? Clears the request.
    pub fn take_restart(&mut self) -> bool {
        core::mem::take(&mut self.restart)
    }

    /// Log the state of everything
    pub fn show_state(&self) {
        self.comm.show_state(self.now);
        self.sched.show_state(self.now);
        node_info!(
            "node: tx {=u32} rx {=u32} resets {=u32} sensor errors {=u32}",
            self.stats.transmitted,
            self.stats.received,
            self.stats.resets,
            self.stats.errors_sensor
        );
    }

    /// Persisted configuration
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Change the persisted configuration, and commit it
    pub fn update_storage(&mut self, f: impl FnOnce(&mut Storage)) {
        f(&mut self.storage);
        self.backend.save(&self.storage, true);
    }

    /// Counters
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Battery state
    pub fn battery(&self) -> &Battery {
        &self.battery
    }

    /// The sensor scheduler
    pub fn scheduler(&mut self) -> &mut Scheduler<'a, C> {
        &mut self.sched
    }

    /// Transport management
    pub fn comm(&mut self) -> &mut Comm<C> {
        &mut self.comm
    }

    /// The cellular modem
    pub fn modem(&self) -> &Modem<C> {
        &self.modem
    }

    fn outlook(&self) -> Outlook {
        Outlook {
            status: self.sched.status(),
            mode: self.sched.op_mode(&self.battery),
            uploads_pending: self.sched.any_upload_needed(),
            exclusive_busy: self.sched.any_exclusive_busy(),
            mobile_period: self.sched.mobile_period(),
        }
    }

    fn poll_sensors(&mut self, now: Seconds) {
        let links = Links {
            cell: &mut self.modem,
            lora: &mut self.lora,
        };
        // Without any transport there is no fix to wait for
        let gps_ready = self.storage.wan == WanMode::None || self.comm.gps_completed(&self.storage, &links);
        let uart_switching = self.comm.uart_switching_allowed(&self.storage);

        let mut env = SchedEnv {
            now,
            storage: &self.storage,
            stats: &mut self.stats,
            uart: &mut self.uart,
            battery: &mut self.battery,
            power: &mut self.power,
            comm_mode: self.comm.mode(),
            comm_active: !self.comm.is_deselected(),
            uart_switching,
            gps_ready,
        };
        self.sched.poll(&mut env);
    }

    fn drain_events(&mut self, now: Seconds) {
        while let Some(event) = self.modem.take_event() {
            match event {
                Event::SaveStorage { force } => self.backend.save(&self.storage, force),
                Event::RestartRequested => self.restart = true,
                Event::Received => {
                    let Some(hex) = self.modem.take_received() else {
                        continue;
                    };
                    self.with_comm(now, |comm, env, links, _| {
                        comm.received(env, links, &hex);
                    });
                }
                event => {
                    let outlook = self.outlook();
                    self.with_comm(now, |comm, env, links, sched| {
                        comm.on_event(env, links, sched, &outlook, event)
                    });
                }
            }
        }
    }

    fn with_comm<R>(
        &mut self,
        now: Seconds,
        f: impl FnOnce(&mut Comm<C>, &mut Env<'_>, &mut Links<'_>, &mut Scheduler<'a, C>) -> R,
    ) -> R {
        let Self {
            device_id,
            storage,
            stats,
            uart,
            sched,
            comm,
            modem,
            lora,
            ..
        } = self;
        let mut env = Env::new(now, storage, stats, uart);
        env.device_id = *device_id;
        let mut links = Links { cell: modem, lora };
        f(comm, &mut env, &mut links, sched)
    }
}
