//! Cellular modem transport
//!
//! This drives an AT-command cellular modem with a built-in GPS receiver.
//! The modem is strictly half duplex from our point of view: we send one
//! command, and then classify lines as they come back until the reply we
//! were waiting for shows up. Unsolicited lines (incoming data, spontaneous
//! reboots, SIM errors, GPS reports) can arrive in between at any time, and
//! are handled by a common filter before any state gets to look at a line.
//!
//! The protocol state is a closed [State] enum. The transition function
//! returns a [Step], which either waits for the next line, or asks to run
//! the next state immediately on an empty line (a "nested" transition, for
//! decisions that need no round trip to the modem). The driving loop is a
//! bounded trampoline, so nested transitions never recurse.
//!
//! Nothing here touches the UART directly. Outbound commands and payloads
//! are queued, and the owner drains them with [Modem::next_tx].
//! Notifications for comm are queued as [Event]s.

use core::{fmt::Write, marker::PhantomData};

use heapless::{Deque, String};

use crate::{
    cmdbuf::{CmdBuf, Line},
    comm::{ConnectState, Event, ReplyType, SendError, Transport},
    config::{DefaultCfg, DfuStatus, HostName, Location, NodeCfg},
    uart::UartOwner,
    Env, Seconds,
};

mod deferred;
mod dfu;
mod gps;
mod reply;
mod state;

pub use deferred::MTU;
pub use gps::GpsStatus;
pub use state::State;

use deferred::Deferred;
use dfu::Dfu;
use gps::Gps;
use state::Step;

/// Longest single command we send
pub type Command = String<128>;

const TX_QUEUE: usize = 10;
const EVENT_QUEUE: usize = 12;
const MAX_NESTED: usize = 16;

/// Something to write to the modem UART
#[derive(Debug, Clone, PartialEq)]
pub enum Tx {
    /// A command line, to be terminated with a carriage return
    Command(Command),
    /// The raw bytes of [Modem::payload], unterminated
    Payload,
}

/// Cellular modem protocol driver
pub struct Modem<C: NodeCfg = DefaultCfg> {
    cmd: CmdBuf<State>,
    tx: Deque<Tx, TX_QUEUE>,
    events: Deque<Event, EVENT_QUEUE>,
    deferred: Deferred,
    inbox: Line,
    received: Option<Line>,
    awaiting_reply: bool,

    powered: bool,
    watchdog_set: Seconds,
    extend_watchdog: bool,
    no_network: bool,
    init_in_progress: bool,
    init_completed: bool,
    init_last_initiated: Seconds,
    first_reset: bool,
    force_full_reset: bool,
    recording_stats: bool,
    lock: bool,
    received_since_powerup: u32,

    apn: String<32>,
    udp_addr: HostName,
    tcp_addr: HostName,
    last_dns: Option<Seconds>,
    open_retries: u8,

    gps: Gps,
    dfu: Dfu,
    _cfg: PhantomData<C>,
}

impl<C: NodeCfg> Default for Modem<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: NodeCfg> Modem<C> {
    /// Create a powered-down modem. Nothing happens until [Modem::init].
    pub const fn new() -> Self {
        Self {
            cmd: CmdBuf::new(State::ResetReq),
            tx: Deque::new(),
            events: Deque::new(),
            deferred: Deferred::new(),
            inbox: Line::new(),
            received: None,
            awaiting_reply: false,
            powered: false,
            watchdog_set: 0,
            extend_watchdog: false,
            no_network: false,
            init_in_progress: false,
            init_completed: false,
            init_last_initiated: 0,
            first_reset: false,
            force_full_reset: true,
            recording_stats: false,
            lock: false,
            received_since_powerup: 0,
            apn: String::new(),
            udp_addr: String::new(),
            tcp_addr: String::new(),
            last_dns: None,
            open_retries: 0,
            gps: Gps {
                shutdown: false,
                send_shutdown_when_idle: false,
                have_location: false,
                update_location: false,
                data_parsed: false,
                partial: false,
                location: None,
            },
            dfu: Dfu::new(),
            _cfg: PhantomData,
        }
    }

    /// Prepare for a power-up. The handshake itself starts on [Modem::reset],
    /// which [Modem::needed_to_be_reset] calls once the boot delay is over.
    pub fn init(&mut self, env: &mut Env<'_>) {
        self.cmd.init(State::ResetReq);
        self.no_network = false;
        self.deferred.clear();
        self.awaiting_reply = false;
        self.init_in_progress = false;
        self.init_completed = false;
        self.first_reset = true;
        self.received_since_powerup = 0;
        self.dfu.in_progress = env.storage.dfu_status == DfuStatus::Pending;
        self.gps.send_shutdown_when_idle = false;
        self.gps.update_location = false;
        self.powered = true;
    }

    /// Stop, so that we look idle while deselected
    pub fn term(&mut self, env: &mut Env<'_>, power_down: bool) {
        if power_down {
            env.uart.release(UartOwner::Cell);
            self.powered = false;
        }
        self.deferred.clear();
        self.awaiting_reply = false;
        self.watchdog_set = env.now;
        self.gps.send_shutdown_when_idle = false;
        self.cmd.flush();
        self.tx.clear();
        self.enter(env.now, State::Idle);
    }

    /// Restart the init handshake. `force` also abandons a firmware update
    /// and restarts even if init is already underway.
    pub fn reset(&mut self, env: &mut Env<'_>, force: bool) {
        if let Some(step) = self.reset_step(env, force) {
            self.cmd.reset();
            self.run(env, step);
        }
    }

    /// Make the next reset a full hardware reset
    pub fn request_full_reset(&mut self) {
        self.force_full_reset = true;
    }

    /// Feed one byte from the UART
    pub fn received_byte(&mut self, byte: u8) {
        self.received_since_powerup = self.received_since_powerup.wrapping_add(1);
        if self.deferred.is_armed() && byte == b'>' {
            self.deferred.mark_ready();
        } else {
            self.cmd.received_byte(byte);
        }
    }

    /// Handle everything received since the last call
    pub fn process(&mut self, env: &mut Env<'_>) {
        // Anything queued for us before the UART was reassigned is stale
        if !env.uart.is_selected(UartOwner::Cell) {
            return;
        }

        if self.deferred.take_ready() {
            self.process_deferred();
        }

        while self.cmd.load_next() {
            let state = self.cmd.state();
            node_trace!("modem: rx line");

            if !matches!(state, State::ResetReq) && !self.init_in_progress && !self.init_completed {
                self.enter(env.now, State::Idle);
            } else {
                let step = self.handle(env, state);
                self.run(env, step);
            }
            self.cmd.reset();
        }
    }

    /// Would starting a send right now be pointless?
    pub fn is_busy(&mut self, now: Seconds) -> bool {
        if !matches!(self.cmd.state(), State::Idle) {
            return true;
        }

        if self.deferred.is_active() {
            if self.deferred.expire(now, C::DEFERRED_STALE_SECONDS) {
                node_warn!("modem: transmit timeout");
                return false;
            }
            return true;
        }

        if self.gps.send_shutdown_when_idle {
            return true;
        }

        if self.gps.update_location {
            let window = if self.gps.have_location {
                C::GPS_ABORT_IMPROVE_SECONDS
            } else {
                C::GPS_ABORT_FIRST_SECONDS
            };
            if now.wrapping_sub(self.init_last_initiated) < window {
                return true;
            }
            self.gps.update_location = false;
        }

        false
    }

    /// Is the data session up?
    pub fn can_send(&self) -> bool {
        !self.no_network && self.init_completed
    }

    /// Start sending `data` to the service
    ///
    /// Without a reply this is a single UDP datagram; otherwise a TCP session
    /// is opened, the data sent, and the reply awaited. The payload is held
    /// until the modem prompts for it.
    pub fn send_to_service(
        &mut self,
        env: &mut Env<'_>,
        data: &[u8],
        reply: ReplyType,
    ) -> Result<(), SendError> {
        if !self.powered {
            return Err(SendError::NotInitialized);
        }
        if self.is_busy(env.now) || !self.tx.is_empty() {
            return Err(SendError::Busy);
        }
        self.deferred.claim(env.now, data, reply)?;
        self.awaiting_reply = reply != ReplyType::None;
        env.stats.transmitted = env.stats.transmitted.wrapping_add(data.len() as u32);

        match reply {
            ReplyType::None => {
                node_debug!("modem: udp send {=usize}", data.len());
                self.deferred.arm(true);
                let addr = self.address(env, false);
                let port = env.storage.service_udp_port;
                self.send(
                    env,
                    format_args!("at+cipsend=0,{},\"{}\",{}", data.len(), addr, port),
                );
                self.enter(env.now, State::MiscRpl);
            }
            ReplyType::Service => {
                node_debug!("modem: tcp send {=usize}", data.len());
                self.open_retries = 8;
                self.event(Event::ConnectState(ConnectState::AppService));
                self.send_open(env);
                self.enter(env.now, State::CipopenRpl2(Default::default()));
            }
        }
        Ok(())
    }

    /// Periodic supervision. Returns `true` if it took some recovery action,
    /// in which case nothing else should be attempted this tick.
    pub fn needed_to_be_reset(&mut self, env: &mut Env<'_>) -> bool {
        let now = env.now;
        let idle = matches!(self.cmd.state(), State::Idle);

        if self.gps.send_shutdown_when_idle && idle {
            self.gps.send_shutdown_when_idle = false;
            self.send(env, format_args!("at+cgpsinfo=0"));
            self.enter(now, State::CgpsInfo2Rpl);
            return true;
        }

        // Modem missing or not powered
        if self.received_since_powerup == 0
            && now > C::BOOT_DELAY_SECONDS
            && !self.lock
            && !self.init_completed
            && self.init_in_progress
        {
            node_warn!("modem: non-responsive");
            self.no_network = true;
            self.gps_shutdown(env);
            self.event(Event::Shutdown);
            self.event(Event::OneshotCompleted);
            return true;
        }

        // Let the module settle after boot before the first handshake
        if !self.init_completed && !self.init_in_progress && now > C::BOOT_DELAY_SECONDS {
            node_debug!("modem: first reset");
            self.reset(env, false);
            return true;
        }

        if self.watchdog_set > now {
            self.watchdog_set = now;
        }

        if now >= C::WATCHDOG_SECONDS && !idle {
            let ceiling = if self.extend_watchdog {
                C::WATCHDOG_EXTENDED_SECONDS
            } else {
                C::WATCHDOG_SECONDS
            };
            if now - self.watchdog_set > ceiling {
                node_error!("modem: watchdog, stuck in {}", self.cmd.state());
                self.force_full_reset = true;
                self.watchdog_set = now;
                if env.oneshot {
                    self.event(Event::Reselect);
                } else {
                    self.reset(env, true);
                }
                env.stats.errors_fona = env.stats.errors_fona.wrapping_add(1);
                return true;
            }
        }

        false
    }

    /// Acquire a fresh GPS fix on the next power-up
    pub fn gps_update(&mut self) {
        self.gps.update_location = true;
        self.gps.shutdown = false;
    }

    /// Stop the GPS receiver, with or without a fix
    pub fn gps_shutdown(&mut self, env: &mut Env<'_>) {
        if self.gps.shutdown {
            return;
        }
        self.gps.shutdown = true;
        self.gps.have_location = true;
        self.gps.update_location = false;
        node_info!("modem: gps acquired");

        // May come while powered down, in which case there's nothing to send
        if self.powered && !env.deselected {
            self.gps.send_shutdown_when_idle = true;
            // Held on only for the fix
            if !self.lock && self.no_network {
                self.event(Event::Shutdown);
            }
        }
    }

    /// Location acquisition progress
    pub fn gps_status(&self) -> GpsStatus {
        self.gps.status()
    }

    /// Location, if the receiver got a fix
    pub fn gps_location(&self) -> Option<Location> {
        match self.gps.status() {
            GpsStatus::Full => self.gps.location,
            _ => None,
        }
    }

    /// Next notification for comm
    pub fn take_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Next thing to write to the UART
    pub fn next_tx(&mut self) -> Option<Tx> {
        self.tx.pop_front()
    }

    /// Bytes to write for [Tx::Payload]
    pub fn payload(&self) -> &[u8] {
        self.deferred.payload()
    }

    /// Hex text of the last reply from the service
    pub fn take_received(&mut self) -> Option<Line> {
        self.received.take()
    }

    /// Current protocol state
    pub fn state(&self) -> State {
        self.cmd.state()
    }

    /// Is a reply from the service still expected?
    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// Lines dropped because they arrived faster than they were processed
    pub fn line_overflows(&self) -> u32 {
        self.cmd.overflows()
    }

    //
    // Internals shared by the state handlers
    //

    fn reset_step(&mut self, env: &mut Env<'_>, force: bool) -> Option<Step> {
        if force {
            self.dfu_terminate(env, crate::config::DfuError::Reset);
        }

        if env.deselected {
            self.init_completed = true;
            self.init_in_progress = false;
            return Some(Step::Wait(State::Idle));
        }

        if !force && self.init_in_progress {
            return None;
        }

        Some(Step::Nested(State::ResetReq))
    }

    /// Apply `step`, running nested transitions until one waits for input
    fn run(&mut self, env: &mut Env<'_>, mut step: Step) {
        for _ in 0..MAX_NESTED {
            match step {
                Step::Wait(next) => {
                    self.enter(env.now, next);
                    return;
                }
                Step::Nested(next) => {
                    self.enter(env.now, next);
                    // A nested state always starts from an empty line
                    self.cmd.reset();
                    step = self.handle(env, next);
                }
            }
        }
        node_error!("modem: nested transition limit");
        self.enter(env.now, State::Idle);
    }

    fn enter(&mut self, now: Seconds, next: State) {
        if core::mem::discriminant(&self.cmd.state()) != core::mem::discriminant(&next) {
            self.watchdog_set = now;
        }
        self.cmd.set_state(next);
    }

    fn send(&mut self, env: &Env<'_>, args: core::fmt::Arguments<'_>) {
        if !env.uart.is_selected(UartOwner::Cell) {
            return;
        }
        let mut cmd = Command::new();
        if cmd.write_fmt(args).is_err() {
            node_warn!("modem: command truncated");
        }
        node_trace!("modem: > {=str}", cmd.as_str());
        if self.tx.push_back(Tx::Command(cmd)).is_err() {
            node_error!("modem: tx queue full");
        }
    }

    fn send_open(&mut self, env: &Env<'_>) {
        let addr = self.address(env, true);
        let port = env.storage.service_tcp_port;
        self.send(env, format_args!("at+cipopen=1,\"TCP\",\"{}\",{}", addr, port));
    }

    fn event(&mut self, event: Event) {
        if self.events.push_back(event).is_err() {
            node_error!("modem: event queue full");
        }
    }

    /// Resolved service address, or the configured host if not yet resolved
    fn address(&self, env: &Env<'_>, tcp: bool) -> HostName {
        let (resolved, configured) = if tcp {
            (&self.tcp_addr, &env.storage.service_tcp)
        } else {
            (&self.udp_addr, &env.storage.service_udp)
        };
        if resolved.is_empty() {
            configured.clone()
        } else {
            resolved.clone()
        }
    }

    fn process_deferred(&mut self) {
        self.tx_payload();
        if self.deferred.sent() {
            self.event(Event::OneshotCompleted);
        }
    }

    fn tx_payload(&mut self) {
        if self.tx.push_back(Tx::Payload).is_err() {
            node_error!("modem: tx queue full");
        }
    }

    fn process_received(&mut self, env: &mut Env<'_>) {
        // Only one receive window per request
        self.awaiting_reply = false;
        if !self.inbox.is_empty() {
            env.stats.received = env.stats.received.wrapping_add((self.inbox.len() / 2) as u32);
            self.received = Some(core::mem::take(&mut self.inbox));
            self.event(Event::Received);
        }
        self.deferred.release();
        self.event(Event::OneshotCompleted);
    }
}

impl<C: NodeCfg> Transport for Modem<C> {
    fn init(&mut self, env: &mut Env<'_>) {
        Modem::init(self, env)
    }

    fn term(&mut self, env: &mut Env<'_>, power_down: bool) {
        Modem::term(self, env, power_down)
    }

    fn reset(&mut self, env: &mut Env<'_>, force: bool) {
        Modem::reset(self, env, force)
    }

    fn request_full_reset(&mut self) {
        Modem::request_full_reset(self)
    }

    fn is_busy(&mut self, now: Seconds) -> bool {
        Modem::is_busy(self, now)
    }

    fn can_send(&self) -> bool {
        Modem::can_send(self)
    }

    fn send_to_service(
        &mut self,
        env: &mut Env<'_>,
        data: &[u8],
        reply: ReplyType,
    ) -> Result<(), SendError> {
        Modem::send_to_service(self, env, data, reply)
    }

    fn needed_to_be_reset(&mut self, env: &mut Env<'_>) -> bool {
        Modem::needed_to_be_reset(self, env)
    }

    fn process(&mut self, env: &mut Env<'_>) {
        Modem::process(self, env)
    }

    fn take_event(&mut self) -> Option<Event> {
        Modem::take_event(self)
    }

    fn take_received(&mut self) -> Option<Line> {
        Modem::take_received(self)
    }

    fn mtu(&self) -> usize {
        MTU
    }

    fn uart(&self) -> UartOwner {
        UartOwner::Cell
    }

    fn gps_status(&self) -> GpsStatus {
        Modem::gps_status(self)
    }

    fn gps_update(&mut self) {
        Modem::gps_update(self)
    }

    fn gps_shutdown(&mut self, env: &mut Env<'_>) {
        Modem::gps_shutdown(self, env)
    }

    fn gps_location(&self) -> Option<Location> {
        Modem::gps_location(self)
    }
}
