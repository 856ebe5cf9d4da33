//! Transport selection and oneshot sessions
//!
//! [Comm] decides which wide-area transport is powered, and when. In
//! "oneshot" operation a transport is powered up only when there is
//! something to upload, kept up until the upload (and at most one reply)
//! has gone through, and powered down again so that the shared UART can be
//! handed to UART-attached sensors.
//!
//! Transports are anything implementing [Transport]. They never call back
//! into comm; instead they queue [Event]s, which the owner hands to
//! [Comm::on_event] after each poll.

use core::marker::PhantomData;

use rand_core::RngCore;

use crate::{
    battery::{BatteryStatus, OpMode},
    cmdbuf::Line,
    config::{DefaultCfg, DfuStatus, Location, NodeCfg, Storage, WanMode},
    modem::GpsStatus,
    timer::Interval,
    uart::UartOwner,
    wire::{self, Report, ReportTopic, StatsReport, StatsTopic, Telecast},
    Env, Seconds,
};

/// What kind of answer a send expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ReplyType {
    /// Fire and forget
    None,
    /// One reply from the service
    Service,
}

/// Why a send was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum SendError {
    /// The transport is not powered
    NotInitialized,
    /// The transport is in the middle of something
    Busy,
    /// A previous send has not gone out yet
    DeferredActive,
    /// The message doesn't fit the transport
    TooLarge,
}

/// How far the current transport got towards the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ConnectState {
    /// Nothing selected yet
    Unknown,
    /// LoRa radio starting
    LoraModule,
    /// Modem starting
    FonaModule,
    /// Waiting for carrier service
    WirelessService,
    /// Waiting for the data session
    DataService,
    /// Waiting for the service
    AppService,
    /// Waiting for a LoRa gateway
    LoraGateway,
    /// Waiting for a LoRaWAN gateway
    LoraWanGateway,
    /// LoRa radio powered down
    LoraDeselected,
    /// Modem powered down
    FonaDeselected,
    /// LoRa up
    LoraActive,
    /// LoRaWAN up
    LoraWanActive,
    /// Modem up
    FonaActive,
}

impl ConnectState {
    /// For status output
    pub fn description(self) -> &'static str {
        match self {
            ConnectState::Unknown => "(not yet connected)",
            ConnectState::LoraModule => "Starting Lora",
            ConnectState::FonaModule => "Starting Cell",
            ConnectState::WirelessService => "Waiting for cell service",
            ConnectState::DataService => "Waiting for cell data",
            ConnectState::AppService => "Waiting for Safecast service",
            ConnectState::LoraGateway => "Waiting for Lora gateway",
            ConnectState::LoraWanGateway => "Waiting for LoraWAN gateway",
            ConnectState::LoraDeselected => "Lora idle",
            ConnectState::FonaDeselected => "Fona idle",
            ConnectState::LoraActive => "Lora active",
            ConnectState::LoraWanActive => "LoraWAN active",
            ConnectState::FonaActive => "Cell active",
        }
    }
}

/// A notification from a transport to comm, or to the node
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Event {
    /// The transport finished coming up
    SelectCompleted,
    /// The outstanding send, and reply if any, are done
    OneshotCompleted,
    /// The transport has nothing more to do and may be powered down
    Shutdown,
    /// Good time to send whatever is waiting
    UpdateService,
    /// Progress towards the service
    ConnectState(ConnectState),
    /// The transport is stuck; power cycle it
    Reselect,
    /// The storage record changed
    SaveStorage {
        /// Commit now rather than coalescing
        force: bool,
    },
    /// The node should restart
    RestartRequested,
    /// A reply is waiting in [Transport::take_received]
    Received,
}

/// What a message from the service turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum MessageKind {
    /// Not a message we understand
    NotDecoded,
    /// A broadcast, or a message about some other device
    Telecast,
    /// The service answering us
    ReplyService,
}

/// Which transport is selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum CommMode {
    /// None
    None,
    /// The LoRa radio
    Lora,
    /// The cellular modem
    Fona,
}

/// A wide-area transport
///
/// Every method is non-blocking. Anything a transport wants to tell comm is
/// queued and drained with [Transport::take_event].
pub trait Transport {
    /// Prepare for power-up
    fn init(&mut self, env: &mut Env<'_>);
    /// Stop, optionally powering down
    fn term(&mut self, env: &mut Env<'_>, power_down: bool);
    /// Restart the init handshake
    fn reset(&mut self, env: &mut Env<'_>, force: bool);
    /// Make the next reset a full hardware reset
    fn request_full_reset(&mut self);
    /// Would a send right now be refused or pointless?
    fn is_busy(&mut self, now: Seconds) -> bool;
    /// Is the path to the service up?
    fn can_send(&self) -> bool;
    /// Start sending `data` to the service
    fn send_to_service(&mut self, env: &mut Env<'_>, data: &[u8], reply: ReplyType)
        -> Result<(), SendError>;
    /// Periodic supervision; `true` if a recovery action was taken
    fn needed_to_be_reset(&mut self, env: &mut Env<'_>) -> bool;
    /// Handle everything received since the last call
    fn process(&mut self, env: &mut Env<'_>);
    /// Next notification
    fn take_event(&mut self) -> Option<Event>;
    /// Hex text of the last reply from the service
    fn take_received(&mut self) -> Option<Line>;
    /// Largest message that can be sent
    fn mtu(&self) -> usize;
    /// UART selection this transport needs
    fn uart(&self) -> UartOwner;

    /// Location acquisition progress
    fn gps_status(&self) -> GpsStatus {
        GpsStatus::NotConfigured
    }
    /// Acquire a fresh location on the next power-up
    fn gps_update(&mut self) {}
    /// Stop acquiring a location
    fn gps_shutdown(&mut self, _env: &mut Env<'_>) {}
    /// Location, if acquired
    fn gps_location(&self) -> Option<Location> {
        None
    }
    /// Is this transport present on the board?
    fn fitted(&self) -> bool {
        true
    }
}

/// Stand-in for a transport that isn't on this board
#[derive(Debug, Default)]
pub struct Absent;

impl Transport for Absent {
    fn init(&mut self, _env: &mut Env<'_>) {}
    fn term(&mut self, _env: &mut Env<'_>, _power_down: bool) {}
    fn reset(&mut self, _env: &mut Env<'_>, _force: bool) {}
    fn request_full_reset(&mut self) {}
    fn is_busy(&mut self, _now: Seconds) -> bool {
        false
    }
    fn can_send(&self) -> bool {
        false
    }
    fn send_to_service(
        &mut self,
        _env: &mut Env<'_>,
        _data: &[u8],
        _reply: ReplyType,
    ) -> Result<(), SendError> {
        Err(SendError::NotInitialized)
    }
    fn needed_to_be_reset(&mut self, _env: &mut Env<'_>) -> bool {
        false
    }
    fn process(&mut self, _env: &mut Env<'_>) {}
    fn take_event(&mut self) -> Option<Event> {
        None
    }
    fn take_received(&mut self) -> Option<Line> {
        None
    }
    fn mtu(&self) -> usize {
        0
    }
    fn uart(&self) -> UartOwner {
        UartOwner::Lora
    }
    fn fitted(&self) -> bool {
        false
    }
}

/// The transports comm can choose between
pub struct Links<'a> {
    /// Cellular modem
    pub cell: &'a mut dyn Transport,
    /// LoRa radio
    pub lora: &'a mut dyn Transport,
}

impl<'a> Links<'a> {
    /// The transport for `mode`
    pub fn get(&mut self, mode: CommMode) -> Option<&mut (dyn Transport + 'a)> {
        match mode {
            CommMode::None => None,
            CommMode::Lora => Some(&mut *self.lora),
            CommMode::Fona => Some(&mut *self.cell),
        }
    }

    fn get_ref(&self, mode: CommMode) -> Option<&(dyn Transport + 'a)> {
        match mode {
            CommMode::None => None,
            CommMode::Lora => Some(&*self.lora),
            CommMode::Fona => Some(&*self.cell),
        }
    }
}

/// What the rest of the node looks like, as far as comm cares
#[derive(Debug, Clone, Copy)]
pub struct Outlook {
    /// Battery band
    pub status: BatteryStatus,
    /// Operating mode
    pub mode: OpMode,
    /// Some sensor group has readings to upload
    pub uploads_pending: bool,
    /// An exclusive sensor group is running
    pub exclusive_busy: bool,
    /// Oneshot interval in mobile mode
    pub mobile_period: Seconds,
}

impl Default for Outlook {
    fn default() -> Self {
        Self {
            status: BatteryStatus::NORMAL,
            mode: OpMode::Normal,
            uploads_pending: false,
            exclusive_busy: false,
            mobile_period: 60,
        }
    }
}

/// Where readings come from when it's time to upload
pub trait ReportSource {
    /// Fill in whatever readings are waiting. Returns false if there are none.
    fn fill_report(&self, report: &mut Report) -> bool;
    /// The readings last filled in have been handed to a transport
    fn report_sent(&mut self);
}

const WORST_TIMES: usize = 10;
const WORST_PURGE: usize = 5;
const WORST_PURGE_SECONDS: Seconds = 24 * 60 * 60;
const SEND_BUF: usize = 128;

/// Transport selection and oneshot state
pub struct Comm<C: NodeCfg = DefaultCfg> {
    initialized: bool,
    mode: CommMode,
    deselected: bool,
    waiting_for_first_select: bool,
    oneshot_completed_next_poll: bool,
    oneshot_completed: bool,
    oneshot_disabled: bool,
    call_now: bool,
    force_cell: bool,
    failover_at: Option<Seconds>,
    restart: bool,
    op_mode: OpMode,

    powered_up: Interval,
    last_powered_up: Option<Seconds>,
    last_oneshot: Interval,
    last_stats: Interval,

    select_in_progress: bool,
    last_select: Option<Seconds>,
    failed_selects: u32,
    total_selects: u32,
    worst: [Seconds; WORST_TIMES],
    worst_purge_index: usize,
    absolute_worst: Seconds,
    last_purge: Interval,

    connect_state: ConnectState,
    reason: &'static str,
    seq_no: u32,
    _cfg: PhantomData<C>,
}

impl<C: NodeCfg> Default for Comm<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: NodeCfg> Comm<C> {
    /// Nothing selected, and nothing will be until [Comm::init]
    pub const fn new() -> Self {
        Self {
            initialized: false,
            mode: CommMode::None,
            deselected: true,
            waiting_for_first_select: false,
            oneshot_completed_next_poll: false,
            oneshot_completed: false,
            oneshot_disabled: false,
            call_now: false,
            force_cell: false,
            failover_at: None,
            restart: false,
            op_mode: OpMode::Normal,
            powered_up: Interval::never(),
            last_powered_up: None,
            last_oneshot: Interval::never(),
            last_stats: Interval::never(),
            select_in_progress: false,
            last_select: None,
            failed_selects: 0,
            total_selects: 0,
            worst: [0; WORST_TIMES],
            worst_purge_index: 0,
            absolute_worst: 0,
            last_purge: Interval::never(),
            connect_state: ConnectState::Unknown,
            reason: "",
            seq_no: 0,
            _cfg: PhantomData,
        }
    }

    /// Start with everything deselected, and arm the first select
    ///
    /// The first oneshot is staggered two thirds of an interval away from
    /// boot, with a little jitter, so that it doesn't line up with the
    /// sensor measurement tempo.
    pub fn init(&mut self, env: &mut Env<'_>, links: &mut Links<'_>, outlook: &Outlook, rng: &mut impl RngCore) {
        self.select(env, links, CommMode::None, "init");
        self.op_mode = outlook.mode;
        self.powered_up.clear();
        self.last_powered_up = None;
        let interval = self.oneshot_interval(env.storage, outlook);
        let jitter = if interval > 3 { rng.next_u32() % (interval / 3) } else { 0 };
        self.last_oneshot = Interval::at(env.now + (2 * interval / 3) + jitter);
        self.initialized = true;
        self.waiting_for_first_select = true;
    }

    /// Selected transport, which may be powered down
    pub fn mode(&self) -> CommMode {
        self.mode
    }

    /// Is the selected transport powered down?
    pub fn is_deselected(&self) -> bool {
        self.deselected
    }

    /// Last progress reported by the selected transport
    pub fn connect_state(&self) -> ConnectState {
        self.connect_state
    }

    /// Selects attempted, and how many of them never completed
    pub fn select_counts(&self) -> (u32, u32) {
        (self.total_selects, self.failed_selects)
    }

    /// Longest time a select ever took to complete
    pub fn absolute_worst(&self) -> Seconds {
        self.absolute_worst
    }

    /// Does the node need restarting? Clears the request.
    pub fn take_restart(&mut self) -> bool {
        core::mem::take(&mut self.restart)
    }

    /// Start a session as soon as possible, ignoring the oneshot interval
    pub fn call_now(&mut self) {
        self.call_now = true;
    }

    /// Keep the selected transport up rather than running oneshots
    pub fn disable_oneshot(&mut self) {
        self.oneshot_disabled = true;
    }

    /// Give up on the primary transport and use cellular oneshots
    pub fn force_cell(&mut self) {
        self.force_cell = true;
    }

    /// Send stats on the next update
    pub fn initiate_service_update(&mut self) {
        self.last_stats.clear();
    }

    /// Update the context flags the transports look at
    pub fn prepare(&self, env: &mut Env<'_>, links: &Links<'_>) {
        env.oneshot = self.oneshot_currently_enabled(env.storage, links);
        env.deselected = self.deselected;
        env.fallback = env.storage.wan == WanMode::Auto && links.lora.fitted();
    }

    /// One tick of transport management
    pub fn poll(
        &mut self,
        env: &mut Env<'_>,
        links: &mut Links<'_>,
        source: &mut dyn ReportSource,
        outlook: &Outlook,
    ) {
        if !self.initialized {
            return;
        }
        self.op_mode = outlook.mode;
        self.prepare(env, links);
        let now = env.now;

        if core::mem::take(&mut self.oneshot_completed_next_poll) {
            self.oneshot_completed = true;
        }

        if self.waiting_for_first_select {
            if env.uart.owner() != UartOwner::None || now < C::BOOT_DELAY_SECONDS {
                return;
            }
            let wan = if env.storage.dfu_status == DfuStatus::Pending {
                WanMode::Fona
            } else {
                env.storage.wan
            };
            let gps_done = self.gps_completed(env.storage, links);
            match wan {
                WanMode::None => self.select(env, links, CommMode::None, "no comms"),
                WanMode::Fona | WanMode::FonaPlusMobile => {
                    self.select(env, links, CommMode::Fona, "cell desired")
                }
                _ if !gps_done => self.select(env, links, CommMode::Fona, "gps needed"),
                _ => {
                    let mode = Self::lora_if_available(wan, links);
                    self.select(env, links, mode, "lora desired")
                }
            }
            if self.mode != CommMode::None {
                self.waiting_for_first_select = false;
            }
            return;
        }

        if self.failover(env.storage) && self.mode != CommMode::Fona {
            node_warn!("comm: failing over to cell");
            self.failover_at = Some(now);
            self.select(env, links, CommMode::Fona, "failover");
            return;
        }
        if let Some(at) = self.failover_at {
            if now.wrapping_sub(at) >= C::FAILOVER_RESTART_SECONDS {
                node_info!("comm: restarting to retry the primary transport");
                self.restart = true;
                return;
            }
        }

        if !self.deselected {
            let mode = self.mode;
            match links.get(mode) {
                None => return,
                Some(t) => {
                    if t.needed_to_be_reset(env) {
                        return;
                    }
                }
            }
        }

        if self.oneshot_currently_enabled(env.storage, links) {
            if !self.deselected {
                let can_send = self.can_send(links);
                if !can_send {
                    if let Some(up) = self.powered_up.last() {
                        if now.wrapping_sub(up) >= C::ONESHOT_ABORT_SECONDS {
                            node_warn!("comm: oneshot aborted");
                            self.deselect(env, links, "oneshot aborted");
                        }
                    }
                    return;
                }

                if self.oneshot_completed && !self.is_busy(env, links) {
                    self.oneshot_completed = false;
                    if !self.update_service(env, links, source, outlook) {
                        self.deselect(env, links, "no work");
                    }
                    return;
                }

                if !self.is_busy(env, links)
                    && !self.powered_up.should_suppress(now, C::ONESHOT_UPDATE_SECONDS)
                {
                    if !self.update_service(env, links, source, outlook) {
                        self.deselect(env, links, "oneshot idle");
                    }
                    return;
                }
            }

            if self.deselected
                && env.uart.owner() == UartOwner::None
                && !self.can_send(links)
                && !outlook.exclusive_busy
                && (outlook.uploads_pending || self.call_now)
            {
                let interval = self.oneshot_interval(env.storage, outlook);
                if interval != 0 && !self.last_oneshot.should_suppress_consistently(now, interval) {
                    node_debug!("comm: oneshot");
                    env.stats.oneshots = env.stats.oneshots.wrapping_add(1);
                    self.reselect(env, links);
                }
            }
        }

        if !self.deselected {
            self.update_service(env, links, source, outlook);
        }
    }

    /// Seconds between oneshot sessions
    pub fn oneshot_interval(&self, storage: &Storage, outlook: &Outlook) -> Seconds {
        let configured = Seconds::from(storage.oneshot_minutes) * 60;
        if self.call_now {
            return 1;
        }
        let status = outlook.status;
        if status == BatteryStatus::DEAD {
            24 * 60 * 60
        } else if status == BatteryStatus::EMERGENCY {
            6 * 60 * 60
        } else if status == BatteryStatus::WARNING {
            30 * 60
        } else if status == BatteryStatus::FULL {
            configured.min(C::ONESHOT_FAST_MINUTES * 60)
        } else if status == BatteryStatus::BURN || status == BatteryStatus::TEST {
            5 * 60
        } else if status == BatteryStatus::MOBILE {
            outlook.mobile_period.max(1)
        } else {
            configured
        }
    }

    /// Power down whatever is selected and bring up `which`
    pub fn select(&mut self, env: &mut Env<'_>, links: &mut Links<'_>, which: CommMode, reason: &'static str) {
        self.reason = reason;
        let which = self.mode_override(env.storage, which);
        node_debug!("comm: select {} ({=str})", which, reason);

        if self.select_in_progress {
            self.select_in_progress = false;
            self.failed_selects = self.failed_selects.wrapping_add(1);
            let stats = &mut *env.stats;
            let counter = match self.connect_state {
                ConnectState::LoraModule => Some(&mut stats.errors_connect_lora),
                ConnectState::LoraGateway | ConnectState::LoraWanGateway => {
                    Some(&mut stats.errors_connect_gateway)
                }
                ConnectState::FonaModule => {
                    links.cell.request_full_reset();
                    Some(&mut stats.errors_connect_fona)
                }
                ConnectState::WirelessService => Some(&mut stats.errors_connect_wireless),
                ConnectState::DataService => Some(&mut stats.errors_connect_data),
                ConnectState::AppService => Some(&mut stats.errors_connect_service),
                _ => None,
            };
            if let Some(counter) = counter {
                node_warn!("comm: failed to connect: {=str}", self.connect_state.description());
                *counter = counter.wrapping_add(1);
            }
        }

        if which == CommMode::None {
            self.oneshot_completed = true;
        }

        self.last_select = None;
        self.powered_up.clear();
        self.deselected = true;
        self.connect_state = ConnectState::Unknown;
        env.deselected = true;

        let old = self.mode;
        if let Some(t) = links.get(old) {
            t.term(env, true);
            env.uart.release(t.uart());
            self.connect_state = match old {
                CommMode::Lora => ConnectState::LoraDeselected,
                _ => ConnectState::FonaDeselected,
            };
        }

        if which != CommMode::None {
            self.last_select = Some(env.now);
            self.select_in_progress = true;
            self.total_selects = self.total_selects.wrapping_add(1);
            self.call_now = false;
        }

        self.mode = which;
        self.deselected = which == CommMode::None;
        env.deselected = self.deselected;

        if let Some(t) = links.get(which) {
            env.uart.select(t.uart());
            self.powered_up.mark(env.now);
            self.last_powered_up = Some(env.now);
            self.connect_state = match which {
                CommMode::Lora => ConnectState::LoraModule,
                _ => ConnectState::FonaModule,
            };
            t.init(env);
        }
    }

    /// Power down the selected transport, remembering which it was
    pub fn deselect(&mut self, env: &mut Env<'_>, links: &mut Links<'_>, reason: &'static str) {
        let mode = self.mode;
        self.select(env, links, CommMode::None, reason);
        self.mode = mode;
    }

    /// Power the remembered transport back up
    pub fn reselect(&mut self, env: &mut Env<'_>, links: &mut Links<'_>) {
        if self.deselected {
            let mode = self.mode;
            self.select(env, links, mode, "reselect");
        }
    }

    /// The selected transport is up; record how long that took
    pub fn select_completed(&mut self, now: Seconds, stats: &mut crate::stats::Stats) {
        self.select_in_progress = false;
        let Some(at) = self.last_select.take() else {
            return;
        };
        if now <= at {
            return;
        }
        let took = now - at;
        node_debug!("comm: connected in {=u32}s", took);
        self.absolute_worst = self.absolute_worst.max(took);

        // Forget a few of the worst times every day, so an old outage
        // doesn't dominate forever
        if !self.last_purge.should_suppress(now, WORST_PURGE_SECONDS) {
            for _ in 0..WORST_PURGE {
                self.worst[self.worst_purge_index] = 0;
                self.worst_purge_index = (self.worst_purge_index + 1) % WORST_TIMES;
            }
        }

        if let Some(best) = self.worst.iter_mut().min() {
            if took > *best {
                *best = took;
            }
        }

        let (sum, n) = self
            .worst
            .iter()
            .filter(|t| **t != 0)
            .fold((0u32, 0u32), |(s, n), t| (s.saturating_add(*t), n + 1));
        if n != 0 {
            stats.oneshot_seconds = sum / n;
        }
    }

    /// Can the UART be taken away from the transports between sessions?
    pub fn uart_switching_allowed(&self, storage: &Storage) -> bool {
        if self.oneshot_disabled && !self.failover(storage) {
            return false;
        }
        storage.oneshot_minutes != 0
    }

    /// Are oneshot sessions in effect right now?
    ///
    /// Not until there is a location, and not while a firmware update is
    /// waiting to be downloaded.
    pub fn oneshot_currently_enabled(&self, storage: &Storage, links: &Links<'_>) -> bool {
        if !self.gps_completed(storage, links) {
            return false;
        }
        if storage.dfu_status == DfuStatus::Pending {
            return false;
        }
        self.uart_switching_allowed(storage)
    }

    /// Is the selected transport busy?
    pub fn is_busy(&self, env: &Env<'_>, links: &mut Links<'_>) -> bool {
        match links.get(self.mode) {
            Some(t) => t.is_busy(env.now),
            None => false,
        }
    }

    /// Could a message be sent to the service right now?
    pub fn can_send(&self, links: &Links<'_>) -> bool {
        if self.deselected {
            return false;
        }
        match links.get_ref(self.mode) {
            Some(t) => t.can_send(),
            None => true,
        }
    }

    /// Hand `data` to the selected transport
    pub fn send_to_service(
        &mut self,
        env: &mut Env<'_>,
        links: &mut Links<'_>,
        data: &[u8],
        reply: ReplyType,
    ) -> Result<(), SendError> {
        if self.deselected {
            return Err(SendError::NotInitialized);
        }
        let t = links.get(self.mode).ok_or(SendError::NotInitialized)?;
        if data.len() > t.mtu() {
            return Err(SendError::TooLarge);
        }
        t.send_to_service(env, data, reply)
    }

    /// Send whatever is due. Returns whether something was sent.
    ///
    /// Stats go first, on their own schedule, and ask for a reply so that
    /// the service gets a chance to talk back. Otherwise pending readings
    /// are sent fire-and-forget.
    pub fn update_service(
        &mut self,
        env: &mut Env<'_>,
        links: &mut Links<'_>,
        source: &mut dyn ReportSource,
        outlook: &Outlook,
    ) -> bool {
        if self.is_busy(env, links) {
            return false;
        }

        let mut buf = [0u8; SEND_BUF];
        let stats_interval = self.stats_interval(env.storage, outlook);
        if !self.last_stats.would_suppress(env.now, stats_interval) {
            let report = self.stats_report(env);
            let seq = self.next_seq();
            let Some(len) = wire::send_topic::<StatsTopic>(&mut buf, seq, &report) else {
                node_error!("comm: stats don't fit");
                return false;
            };
            return match self.send_to_service(env, links, &buf[..len], ReplyType::Service) {
                Ok(()) => {
                    node_info!("comm: stats sent");
                    self.last_stats.mark(env.now);
                    true
                }
                Err(e) => {
                    node_debug!("comm: stats deferred, {}", e);
                    false
                }
            };
        }

        let mut report = Report {
            device_id: env.device_id,
            status: outlook.status.bits(),
            ..Default::default()
        };
        if let Some(loc) = self.gps_location(env.storage, links) {
            report.latitude = Some(loc.lat);
            report.longitude = Some(loc.lon);
            report.altitude = Some(loc.alt);
        }
        if !source.fill_report(&mut report) {
            return false;
        }
        let seq = self.next_seq();
        let Some(len) = wire::send_topic::<ReportTopic>(&mut buf, seq, &report) else {
            node_error!("comm: report doesn't fit");
            return false;
        };
        match self.send_to_service(env, links, &buf[..len], ReplyType::None) {
            Ok(()) => {
                source.report_sent();
                true
            }
            Err(e) => {
                node_debug!("comm: report deferred, {}", e);
                false
            }
        }
    }

    /// Act on a transport notification
    ///
    /// [Event::SaveStorage], [Event::RestartRequested] and [Event::Received]
    /// concern the node rather than comm, and are ignored here.
    pub fn on_event(
        &mut self,
        env: &mut Env<'_>,
        links: &mut Links<'_>,
        source: &mut dyn ReportSource,
        outlook: &Outlook,
        event: Event,
    ) {
        match event {
            Event::SelectCompleted => self.select_completed(env.now, env.stats),
            Event::OneshotCompleted => self.oneshot_completed_next_poll = true,
            Event::ConnectState(state) => self.connect_state = state,
            Event::UpdateService => {
                self.update_service(env, links, source, outlook);
            }
            Event::Shutdown => {
                if self.mode != CommMode::Fona || self.deselected {
                    return;
                }
                if env.storage.wan == WanMode::Auto
                    && links.lora.fitted()
                    && self.gps_completed(env.storage, links)
                    && !self.force_cell
                {
                    self.select(env, links, CommMode::Lora, "cell done");
                } else {
                    self.deselect(env, links, "cell done");
                }
            }
            Event::Reselect => {
                self.deselect(env, links, "watchdog");
                self.reselect(env, links);
            }
            Event::SaveStorage { .. } | Event::RestartRequested | Event::Received => {}
        }
    }

    /// Decode a reply from the service and act on any requests in it
    pub fn received(&mut self, env: &mut Env<'_>, links: &mut Links<'_>, hex: &[u8]) -> MessageKind {
        let (kind, msg) = decode_received_message(hex, env.device_id);
        match (kind, msg) {
            (MessageKind::ReplyService, Some(msg)) => {
                node_info!("comm: reply from service");
                if msg.stats_request {
                    self.initiate_service_update();
                }
                if msg.gps_update {
                    self.gps_update(env.storage, links);
                }
            }
            (MessageKind::Telecast, _) => node_debug!("comm: telecast"),
            _ => node_warn!("comm: undecodable reply"),
        }
        kind
    }

    /// Has location acquisition finished, one way or another?
    pub fn gps_completed(&self, storage: &Storage, links: &Links<'_>) -> bool {
        matches!(
            self.gps_status(storage, links),
            GpsStatus::Full | GpsStatus::Partial | GpsStatus::NotConfigured | GpsStatus::Aborted
        )
    }

    /// Location acquisition progress
    pub fn gps_status(&self, storage: &Storage, links: &Links<'_>) -> GpsStatus {
        if storage.static_gps.is_some() {
            return GpsStatus::NotConfigured;
        }
        links.cell.gps_status()
    }

    /// Best known location
    pub fn gps_location(&self, storage: &Storage, links: &Links<'_>) -> Option<Location> {
        storage
            .static_gps
            .or_else(|| links.cell.gps_location())
            .or(storage.lkg_gps)
    }

    /// Acquire a fresh location on the next cellular session
    pub fn gps_update(&mut self, storage: &Storage, links: &mut Links<'_>) {
        if storage.static_gps.is_some() {
            return;
        }
        links.cell.gps_update();
    }

    /// Log where comm is at
    pub fn show_state(&self, now: Seconds) {
        node_info!(
            "comm: {} {=str}, last select {=str}",
            self.mode,
            self.connect_state.description(),
            self.reason
        );
        if let Some(up) = self.last_powered_up {
            node_info!("comm: last powered up {=u32}s ago", now.wrapping_sub(up));
        }
        node_info!(
            "comm: {=u32} selects, {=u32} failed, worst {=u32}s",
            self.total_selects,
            self.failed_selects,
            self.absolute_worst
        );
    }

    /// Without a radio, only the automatic policy may fall back to cell
    fn lora_if_available(wan: WanMode, links: &Links<'_>) -> CommMode {
        if links.lora.fitted() {
            CommMode::Lora
        } else if wan == WanMode::Auto {
            CommMode::Fona
        } else {
            CommMode::None
        }
    }

    fn failover(&self, storage: &Storage) -> bool {
        storage.wan == WanMode::Auto && self.force_cell
    }

    /// In mobile mode the cell transport is used even where LoRa is preferred
    fn mode_override(&self, storage: &Storage, which: CommMode) -> CommMode {
        if which == CommMode::Lora
            && self.op_mode == OpMode::Mobile
            && matches!(storage.wan, WanMode::Auto | WanMode::FonaPlusMobile)
        {
            return CommMode::Fona;
        }
        which
    }

    fn stats_interval(&self, storage: &Storage, outlook: &Outlook) -> Seconds {
        if self.call_now {
            60
        } else if outlook.mode == OpMode::Burn {
            15 * 60
        } else {
            Seconds::from(storage.stats_minutes) * 60
        }
    }

    fn stats_report(&self, env: &Env<'_>) -> StatsReport {
        let s = &*env.stats;
        StatsReport {
            device_id: env.device_id,
            uptime: env.now,
            transmitted: s.transmitted,
            received: s.received,
            resets: s.resets,
            power_fails: s.power_fails,
            ant_fails: s.ant_fails,
            oneshots: s.oneshots,
            oneshot_seconds: s.oneshot_seconds,
            errors_fona: s.errors_fona,
            errors_connect: s
                .errors_connect_lora
                .wrapping_add(s.errors_connect_fona)
                .wrapping_add(s.errors_connect_gateway)
                .wrapping_add(s.errors_connect_wireless)
                .wrapping_add(s.errors_connect_data)
                .wrapping_add(s.errors_connect_service),
            errors_sensor: s.errors_sensor,
            dfu_count: env.storage.dfu_count,
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq_no = self.seq_no.wrapping_add(1);
        self.seq_no
    }
}

/// Classify a hex-encoded message received from the service
///
/// Returns the decoded message along with its kind, unless it could not be
/// decoded at all.
pub fn decode_received_message(hex: &[u8], device_id: u32) -> (MessageKind, Option<Telecast>) {
    let mut bin = [0u8; SEND_BUF];
    let n = wire::hex_decode(hex, &mut bin);
    let Some(frame) = wire::WhBody::try_from(&bin[..n]) else {
        return (MessageKind::NotDecoded, None);
    };
    if frame.wh.key != <wire::TelecastTopic as postcard_rpc::Topic>::TOPIC_KEY {
        return (MessageKind::NotDecoded, None);
    }
    let Ok(msg) = postcard::from_bytes::<Telecast>(frame.body) else {
        return (MessageKind::NotDecoded, None);
    };
    let kind = match msg.device_type {
        wire::DeviceType::Service if msg.device_id == device_id => MessageKind::ReplyService,
        _ => MessageKind::Telecast,
    };
    (kind, Some(msg))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{stats::Stats, uart::Uart, wire::DeviceType};
    use std::vec::Vec;

    /// A transport that comes up as soon as it's told to
    #[derive(Default)]
    struct FakeLink {
        absent: bool,
        owner: Option<UartOwner>,
        powered: bool,
        up: bool,
        busy: bool,
        sent: Vec<(Vec<u8>, ReplyType)>,
        inits: u32,
        full_resets: u32,
        gps: Option<GpsStatus>,
        updates: u32,
    }

    impl Transport for FakeLink {
        fn init(&mut self, _env: &mut Env<'_>) {
            self.powered = true;
            self.inits += 1;
        }
        fn term(&mut self, _env: &mut Env<'_>, _power_down: bool) {
            self.powered = false;
            self.up = false;
        }
        fn reset(&mut self, _env: &mut Env<'_>, _force: bool) {}
        fn request_full_reset(&mut self) {
            self.full_resets += 1;
        }
        fn is_busy(&mut self, _now: Seconds) -> bool {
            self.busy
        }
        fn can_send(&self) -> bool {
            self.up
        }
        fn send_to_service(
            &mut self,
            _env: &mut Env<'_>,
            data: &[u8],
            reply: ReplyType,
        ) -> Result<(), SendError> {
            if !self.powered {
                return Err(SendError::NotInitialized);
            }
            self.sent.push((data.to_vec(), reply));
            Ok(())
        }
        fn needed_to_be_reset(&mut self, _env: &mut Env<'_>) -> bool {
            false
        }
        fn process(&mut self, _env: &mut Env<'_>) {}
        fn take_event(&mut self) -> Option<Event> {
            None
        }
        fn take_received(&mut self) -> Option<Line> {
            None
        }
        fn mtu(&self) -> usize {
            100
        }
        fn uart(&self) -> UartOwner {
            self.owner.unwrap_or(UartOwner::Cell)
        }
        fn fitted(&self) -> bool {
            !self.absent
        }
        fn gps_status(&self) -> GpsStatus {
            self.gps.unwrap_or(GpsStatus::Full)
        }
        fn gps_update(&mut self) {
            self.updates += 1;
        }
    }

    struct Readings {
        pending: bool,
        sent: u32,
    }

    impl ReportSource for Readings {
        fn fill_report(&self, report: &mut Report) -> bool {
            report.cpm0 = Some(30);
            self.pending
        }
        fn report_sent(&mut self) {
            self.pending = false;
            self.sent += 1;
        }
    }

    struct Rig {
        storage: Storage,
        stats: Stats,
        uart: Uart,
        cell: FakeLink,
        lora: FakeLink,
        comm: Comm,
        readings: Readings,
        outlook: Outlook,
        now: Seconds,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                storage: Storage::default(),
                stats: Stats::new(),
                uart: Uart::new(),
                cell: FakeLink::default(),
                lora: FakeLink {
                    absent: true,
                    owner: Some(UartOwner::Lora),
                    ..Default::default()
                },
                comm: Comm::new(),
                readings: Readings { pending: false, sent: 0 },
                outlook: Outlook::default(),
                now: 0,
            }
        }

        fn with<R>(&mut self, f: impl FnOnce(&mut Comm, &mut Env<'_>, &mut Links<'_>, &mut Readings, &Outlook) -> R) -> R {
            let mut env = Env::new(self.now, &mut self.storage, &mut self.stats, &mut self.uart);
            env.device_id = 42;
            let mut links = Links {
                cell: &mut self.cell,
                lora: &mut self.lora,
            };
            f(&mut self.comm, &mut env, &mut links, &mut self.readings, &self.outlook)
        }

        fn init(&mut self) {
            self.with(|c, env, links, _, o| c.init(env, links, o, &mut ZeroRng));
        }

        fn poll(&mut self, now: Seconds) {
            self.now = now;
            self.with(|c, env, links, r, o| c.poll(env, links, r, o));
        }
    }

    struct ZeroRng;

    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    #[test]
    fn oneshot_interval_follows_battery() {
        let rig = Rig::new();
        let mut o = Outlook::default();
        let cases = [
            (BatteryStatus::DEAD, 24 * 3600),
            (BatteryStatus::EMERGENCY, 6 * 3600),
            (BatteryStatus::WARNING, 1800),
            (BatteryStatus::FULL, 600),
            (BatteryStatus::BURN, 300),
            (BatteryStatus::TEST, 300),
            (BatteryStatus::NORMAL, 900),
            (BatteryStatus::LOW, 900),
        ];
        for (status, want) in cases {
            o.status = status;
            assert_eq!(rig.comm.oneshot_interval(&rig.storage, &o), want);
        }
        o.status = BatteryStatus::MOBILE;
        o.mobile_period = 0;
        assert_eq!(rig.comm.oneshot_interval(&rig.storage, &o), 1);
    }

    #[test]
    fn full_battery_keeps_a_shorter_configured_interval() {
        let mut rig = Rig::new();
        rig.storage.oneshot_minutes = 2;
        let o = Outlook {
            status: BatteryStatus::FULL,
            ..Default::default()
        };
        assert_eq!(rig.comm.oneshot_interval(&rig.storage, &o), 120);
        rig.comm.call_now();
        assert_eq!(rig.comm.oneshot_interval(&rig.storage, &o), 1);
    }

    #[test]
    fn first_select_waits_for_boot_delay_and_free_uart() {
        let mut rig = Rig::new();
        rig.init();
        assert_eq!(rig.comm.mode(), CommMode::None);

        rig.poll(10);
        assert_eq!(rig.cell.inits, 0);

        rig.uart.select(UartOwner::Sensor(1));
        rig.poll(40);
        assert_eq!(rig.cell.inits, 0);

        rig.uart.select(UartOwner::None);
        rig.poll(41);
        assert_eq!(rig.comm.mode(), CommMode::Fona);
        assert!(!rig.comm.is_deselected());
        assert_eq!(rig.comm.connect_state(), ConnectState::FonaModule);
        assert!(rig.uart.is_selected(UartOwner::Cell));
        assert_eq!(rig.cell.inits, 1);
    }

    #[test]
    fn lora_preference_without_lora_uses_cell_for_gps_first() {
        let mut rig = Rig::new();
        rig.storage.wan = WanMode::Lora;
        rig.cell.gps = Some(GpsStatus::NoData);
        rig.init();
        rig.poll(31);
        assert_eq!(rig.comm.mode(), CommMode::Fona);
    }

    #[test]
    fn lora_preference_with_gps_and_no_radio_selects_nothing() {
        let mut rig = Rig::new();
        rig.storage.wan = WanMode::Lora;
        rig.init();
        rig.poll(31);
        assert_eq!(rig.comm.mode(), CommMode::None);
        assert_eq!(rig.cell.inits, 0);
    }

    #[test]
    fn failed_select_is_charged_to_the_stage_it_stalled_in() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(31);
        rig.with(|c, env, links, r, o| {
            c.on_event(env, links, r, o, Event::ConnectState(ConnectState::WirelessService))
        });
        rig.with(|c, env, links, _, _| c.deselect(env, links, "test"));
        assert_eq!(rig.stats.errors_connect_wireless, 1);
        assert_eq!(rig.comm.select_counts(), (1, 1));
        assert_eq!(rig.comm.mode(), CommMode::Fona);
        assert!(rig.comm.is_deselected());
        assert_eq!(rig.comm.connect_state(), ConnectState::FonaDeselected);
        assert!(rig.uart.is_selected(UartOwner::None));

        // stalled before the modem even answered
        rig.with(|c, env, links, _, _| c.reselect(env, links));
        rig.with(|c, env, links, _, _| c.deselect(env, links, "test"));
        assert_eq!(rig.stats.errors_connect_fona, 1);
        assert_eq!(rig.cell.full_resets, 1);
    }

    #[test]
    fn select_times_are_averaged() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(100);
        rig.comm.select_completed(130, &mut rig.stats);
        assert_eq!(rig.stats.oneshot_seconds, 30);
        assert_eq!(rig.comm.select_counts(), (1, 0));

        rig.now = 200;
        rig.with(|c, env, links, _, _| {
            c.deselect(env, links, "test");
            c.reselect(env, links);
        });
        rig.comm.select_completed(250, &mut rig.stats);
        assert_eq!(rig.stats.oneshot_seconds, 40);
        assert_eq!(rig.comm.absolute_worst(), 50);
    }

    #[test]
    fn oneshot_session_sends_stats_then_readings_then_powers_down() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(31);
        rig.cell.up = true;
        rig.comm.select_completed(60, &mut rig.stats);

        // stats are due first, and want a reply
        rig.poll(61);
        assert_eq!(rig.cell.sent.len(), 1);
        assert_eq!(rig.cell.sent[0].1, ReplyType::Service);

        rig.readings.pending = true;
        rig.with(|c, env, links, r, o| c.on_event(env, links, r, o, Event::OneshotCompleted));
        rig.poll(62);
        assert_eq!(rig.cell.sent.len(), 2);
        assert_eq!(rig.cell.sent[1].1, ReplyType::None);
        assert_eq!(rig.readings.sent, 1);

        // nothing left, so the next completion powers down
        rig.with(|c, env, links, r, o| c.on_event(env, links, r, o, Event::OneshotCompleted));
        rig.poll(63);
        rig.poll(64);
        assert!(rig.comm.is_deselected());
        assert!(!rig.cell.powered);
    }

    #[test]
    fn unreachable_service_aborts_the_session() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(31);
        rig.poll(31 + 299);
        assert!(!rig.comm.is_deselected());
        rig.poll(31 + 300);
        assert!(rig.comm.is_deselected());
    }

    #[test]
    fn uploads_bring_the_transport_back_on_schedule() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(31);
        rig.with(|c, env, links, _, _| c.deselect(env, links, "test"));
        assert_eq!(rig.cell.inits, 1);

        rig.outlook.uploads_pending = true;
        // first oneshot is staggered to two thirds of the 15 minute interval
        rig.poll(500);
        assert_eq!(rig.cell.inits, 1);
        rig.poll(600 + 900);
        assert_eq!(rig.cell.inits, 2);
        assert_eq!(rig.stats.oneshots, 1);
    }

    #[test]
    fn exclusive_sensors_hold_off_the_oneshot() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(31);
        rig.with(|c, env, links, _, _| c.deselect(env, links, "test"));
        rig.outlook.uploads_pending = true;
        rig.outlook.exclusive_busy = true;
        rig.poll(5000);
        assert_eq!(rig.cell.inits, 1);
        rig.outlook.exclusive_busy = false;
        rig.poll(5001);
        assert_eq!(rig.cell.inits, 2);
    }

    #[test]
    fn no_oneshots_without_switching() {
        let mut rig = Rig::new();
        rig.storage.oneshot_minutes = 0;
        let links = Links {
            cell: &mut rig.cell,
            lora: &mut rig.lora,
        };
        assert!(!rig.comm.uart_switching_allowed(&rig.storage));
        assert!(!rig.comm.oneshot_currently_enabled(&rig.storage, &links));
    }

    #[test]
    fn pending_dfu_or_missing_gps_disables_oneshots() {
        let mut rig = Rig::new();
        rig.cell.gps = Some(GpsStatus::NoLocation);
        {
            let links = Links {
                cell: &mut rig.cell,
                lora: &mut rig.lora,
            };
            assert!(!rig.comm.oneshot_currently_enabled(&rig.storage, &links));
        }
        rig.cell.gps = None;
        rig.storage.dfu_status = DfuStatus::Pending;
        let links = Links {
            cell: &mut rig.cell,
            lora: &mut rig.lora,
        };
        assert!(!rig.comm.oneshot_currently_enabled(&rig.storage, &links));
    }

    #[test]
    fn oversized_send_is_refused() {
        let mut rig = Rig::new();
        rig.init();
        rig.poll(31);
        let big = [0u8; 101];
        let res = rig.with(|c, env, links, _, _| c.send_to_service(env, links, &big, ReplyType::None));
        assert_eq!(res, Err(SendError::TooLarge));
    }

    fn encode(msg: &Telecast) -> std::string::String {
        let mut buf = [0u8; 64];
        let n = wire::send_topic::<wire::TelecastTopic>(&mut buf, 1, msg).unwrap();
        buf[..n].iter().map(|b| format!("{:02X}", b)).collect()
    }

    #[test]
    fn service_reply_is_recognized_and_acted_on() {
        let mut rig = Rig::new();
        rig.init();
        let msg = Telecast {
            device_type: DeviceType::Service,
            device_id: 42,
            gps_update: true,
            stats_request: true,
        };
        let hex = encode(&msg);
        let kind = rig.with(|c, env, links, _, _| c.received(env, links, hex.as_bytes()));
        assert_eq!(kind, MessageKind::ReplyService);
        assert_eq!(rig.cell.updates, 1);
    }

    #[test]
    fn decode_classifies() {
        let other = Telecast {
            device_type: DeviceType::Service,
            device_id: 7,
            gps_update: false,
            stats_request: false,
        };
        let (kind, msg) = decode_received_message(encode(&other).as_bytes(), 42);
        assert_eq!(kind, MessageKind::Telecast);
        assert_eq!(msg, Some(other));

        let node = Telecast {
            device_type: DeviceType::Node,
            ..other
        };
        assert_eq!(decode_received_message(encode(&node).as_bytes(), 7).0, MessageKind::Telecast);

        assert_eq!(decode_received_message(b"zz", 42).0, MessageKind::NotDecoded);
        assert_eq!(decode_received_message(b"", 42).0, MessageKind::NotDecoded);
    }

    #[test]
    fn auto_without_a_radio_uses_cell() {
        let mut rig = Rig::new();
        rig.storage.wan = WanMode::Auto;
        rig.init();
        rig.poll(31);
        assert_eq!(rig.comm.mode(), CommMode::Fona);
    }

    #[test]
    fn failover_restarts_after_a_day() {
        let mut rig = Rig::new();
        rig.storage.wan = WanMode::Auto;
        rig.lora.absent = false;
        rig.init();
        rig.poll(31);
        assert_eq!(rig.comm.mode(), CommMode::Lora);
        assert!(rig.uart.is_selected(UartOwner::Lora));
        rig.comm.force_cell();
        rig.poll(40);
        assert_eq!(rig.comm.mode(), CommMode::Fona);
        assert!(rig.uart.is_selected(UartOwner::Cell));
        assert!(!rig.lora.powered);
        rig.poll(40 + 24 * 3600 - 1);
        assert!(!rig.comm.take_restart());
        rig.poll(40 + 24 * 3600);
        assert!(rig.comm.take_restart());
    }
}
