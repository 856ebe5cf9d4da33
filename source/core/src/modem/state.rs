//! Protocol states and the transition function

use core::fmt::Write;

use heapless::String;

use crate::{
    cmdbuf::Seen,
    comm::{ConnectState, Event},
    config::{NodeCfg, WanMode},
    stats::set_str,
    Env,
};

use super::{reply::is_numeric_host, Modem};

/// Where the modem is in its protocol
///
/// Most states name the reply being waited for. States that need more than
/// one reply line before moving on carry a [Seen] accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum State {
    Idle,
    Complete,

    // Power-up handshake
    ResetReq,
    CgfuncRpl1,
    CresetRpl(Seen),
    StartRpl,
    EchoRpl,
    CgfuncRpl2,
    IfcRpl2,
    NoLed1,
    NoLed2,

    // Location
    CgpsRpl,
    CgpsInfoRpl,
    CgpsInfo2Rpl,
    CgpsInfo3Rpl,

    // Network attach
    CpinRpl,
    CpsiRpl(Seen),
    Cpsi0Rpl,
    AtiRpl,
    CiccidRpl,
    CgsockcontRpl,
    CsocksetpnRpl,
    CipmodeRpl,
    CiptimeoutRpl,
    NetopenRpl(Seen),
    CdnsgipRpl,
    CdnsgipRpl2,
    CipheadRpl,
    CipsripRpl,
    CiprxgetRpl,
    CipopenRpl,
    InitCompleted,

    // Steady state
    CipopenRpl2(Seen),
    CipsendRpl(Seen),
    CipcloseRpl,
    CiprxgetRpl2,
    MiscRpl,

    // Firmware download
    DfuBegin,
    DfuRpl0,
    DfuRpl1,
    DfuRpl2,
    DfuRpl3,
    DfuRpl4,
    DfuRpl4A,
    DfuRpl5,
    DfuRpl5A(Seen),
    DfuRpl6(Seen),
    DfuValidate,
    DfuRpl7,
    DfuRpl8(Seen),
    DfuPrepare,
    DfuRpl9,
}

/// Result of handling one line
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Step {
    /// Store this state and wait for the next line
    Wait(State),
    /// Enter this state and run it right away, without a line
    Nested(State),
}

impl<C: NodeCfg> Modem<C> {
    /// The transition function
    pub(crate) fn handle(&mut self, env: &mut Env<'_>, state: State) -> Step {
        use State::*;

        match state {
            ResetReq => self.reset_req(env),

            CgfuncRpl1 => {
                // A full reset is slow and power hungry, and is only needed
                // to get the GPS going or to recover from a protocol error
                self.gps.send_shutdown_when_idle = false;
                let optimized = self.gps.have_location
                    && !self.gps.update_location
                    && (self.dfu.in_progress || !self.force_full_reset);
                self.force_full_reset = false;
                if optimized {
                    self.send(env, format_args!("ate0"));
                    Step::Wait(EchoRpl)
                } else {
                    node_info!("modem: full reset");
                    self.send(env, format_args!("at+creset"));
                    Step::Wait(CresetRpl(Seen::NONE))
                }
            }

            CresetRpl(seen) => {
                // "start" is expected here, so check before the common filter
                let seen = if self.cmd.this_arg_is("start") {
                    self.recording_stats = true;
                    seen.mark(0x01)
                } else if self.cmd.this_arg_is("+cpin: ready") {
                    seen.mark(0x02)
                } else if self.cmd.this_arg_is("pb done") {
                    seen.mark(0x04)
                } else if let Some(step) = self.common_reply(env, state) {
                    return step;
                } else {
                    seen
                };
                if seen.all(0x07) {
                    self.send(env, format_args!("ate0"));
                    return Step::Wait(EchoRpl);
                }
                Step::Wait(CresetRpl(seen))
            }

            StartRpl => {
                self.send(env, format_args!("ate0"));
                Step::Wait(EchoRpl)
            }

            EchoRpl => {
                let flow = if C::HW_FLOW_CONTROL { 1 } else { 0 };
                self.on_ok(env, state, format_args!("at+cgfunc=11,{}", flow), CgfuncRpl2)
            }

            CgfuncRpl2 => {
                if C::HW_FLOW_CONTROL {
                    self.on_ok(env, state, format_args!("at+ifc=2,2"), IfcRpl2)
                } else {
                    // at+ifc=0,0 fails unless flow control was turned on first
                    Step::Nested(IfcRpl2)
                }
            }

            IfcRpl2 => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                // status LED off
                self.send(env, format_args!("at+cgfunc=1,0"));
                Step::Wait(NoLed1)
            }

            NoLed1 => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                self.send(env, format_args!("at+cleditst=0,0"));
                Step::Wait(NoLed2)
            }

            NoLed2 => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if !self.gps.have_location || self.gps.update_location {
                    self.send(env, format_args!("at+cgps=1"));
                    return Step::Wait(CgpsRpl);
                }
                self.check_service(env)
            }

            CgpsRpl => {
                // The receiver may already have been enabled, which errors
                let acked = self.cmd.this_arg_is("error") || self.cmd.this_arg_is("ok");
                if !acked {
                    if let Some(step) = self.common_reply(env, state) {
                        return step;
                    }
                    return Step::Wait(state);
                }
                self.send(env, format_args!("at+cgpsinfo=10"));
                Step::Wait(CgpsInfoRpl)
            }

            CgpsInfoRpl => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if !self.cmd.this_arg_is("ok") {
                    return Step::Wait(state);
                }
                // Only the cellular policies need the network once there's a fix
                match env.storage.wan {
                    WanMode::Fona | WanMode::FonaPlusMobile => {}
                    WanMode::Auto => {
                        if env.fallback {
                            self.no_network = true;
                        }
                    }
                    _ => self.no_network = true,
                }
                if self.no_network {
                    return Step::Nested(InitCompleted);
                }
                self.send(env, format_args!("at+cpin?"));
                Step::Wait(CpinRpl)
            }

            CgpsInfo2Rpl => self.on_ok(env, state, format_args!("at+cgpsinfocfg=0"), CgpsInfo3Rpl),

            CgpsInfo3Rpl => self.on_ok(env, state, format_args!("at+cgps=0"), MiscRpl),

            CpinRpl => {
                // No SIM shows up as a +cme error
                if let Some(step) = self.common_reply(env, state) {
                    if self.no_network {
                        return Step::Nested(InitCompleted);
                    }
                    return step;
                }
                if self.cmd.this_arg_is("ok") {
                    return self.check_service(env);
                }
                Step::Wait(state)
            }

            CpsiRpl(seen) => self.cpsi(env, seen),

            Cpsi0Rpl => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if !self.cmd.this_arg_is("ok") {
                    return Step::Wait(state);
                }
                if !self.apn.is_empty() {
                    return Step::Nested(CiccidRpl);
                }
                self.send(env, format_args!("ati"));
                Step::Wait(AtiRpl)
            }

            AtiRpl => {
                if self.cmd.this_arg_is("ok") {
                    self.send(env, format_args!("at+ciccid"));
                    return Step::Wait(CiccidRpl);
                }
                if let Some(model) = self.cmd.line().strip_prefix("Model: ") {
                    set_str(&mut env.stats.module_fona, model);
                }
                Step::Wait(state)
            }

            CiccidRpl => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if self.apn.is_empty() {
                    return Step::Wait(state);
                }
                let apn = self.apn.clone();
                self.send(env, format_args!("at+cgsockcont=1,\"IP\",\"{}\"", apn));
                Step::Wait(CgsockcontRpl)
            }

            CgsockcontRpl => self.on_ok(env, state, format_args!("at+csocksetpn=1"), CsocksetpnRpl),

            CsocksetpnRpl => self.on_ok(env, state, format_args!("at+cipmode=0"), CipmodeRpl),

            CipmodeRpl => self.on_ok(
                env,
                state,
                format_args!("at+ciptimeout=120000,30000,120000"),
                CiptimeoutRpl,
            ),

            CiptimeoutRpl => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if !self.cmd.this_arg_is("ok") {
                    return Step::Wait(state);
                }
                self.event(Event::ConnectState(ConnectState::DataService));
                // Attaching to the packet network can take a while
                self.extend_watchdog = true;
                self.send(env, format_args!("at+netopen"));
                Step::Wait(NetopenRpl(Seen::NONE))
            }

            NetopenRpl(seen) => self.netopen(env, seen),

            CdnsgipRpl | CdnsgipRpl2 => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                let tcp = matches!(state, CdnsgipRpl2);
                if self.cmd.this_arg_is("ok") {
                    if tcp {
                        self.send(env, format_args!("at+ciphead=1"));
                        return Step::Wait(CipheadRpl);
                    }
                    let host = self.address(env, true);
                    self.send(env, format_args!("at+cdnsgip=\"{}\"", host));
                    return Step::Wait(CdnsgipRpl2);
                }
                self.dns_reply(tcp);
                Step::Wait(state)
            }

            CipheadRpl => self.on_ok(env, state, format_args!("at+cipsrip=0"), CipsripRpl),

            CipsripRpl => self.on_ok(env, state, format_args!("at+ciprxget=1"), CiprxgetRpl),

            CiprxgetRpl => self.on_ok(
                env,
                state,
                format_args!("at+cipopen=0,\"UDP\",,,9000"),
                CipopenRpl,
            ),

            CipopenRpl => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if self.cmd.this_arg_is("ok") {
                    return Step::Nested(InitCompleted);
                }
                Step::Wait(state)
            }

            InitCompleted => self.init_completed(env),

            CipopenRpl2(seen) => self.cipopen(env, seen),

            CipsendRpl(seen) => {
                // An error still means the session has to be closed
                let seen = if self.cmd.this_arg_is("error") || self.cmd.this_arg_is("ok") {
                    seen.mark(0x01)
                } else if let Some(step) = self.common_reply(env, state) {
                    return step;
                } else if self.cmd.this_arg_is("+ipclose:") {
                    seen.mark(0x02)
                } else {
                    seen
                };
                if seen.all(0x03) {
                    self.extend_watchdog = false;
                    self.send(env, format_args!("at+cipclose=1"));
                    return Step::Wait(CipcloseRpl);
                }
                Step::Wait(CipsendRpl(seen))
            }

            CipcloseRpl => {
                if self.cmd.this_arg_is("error") || self.cmd.this_arg_is("ok") {
                    return Step::Wait(Idle);
                }
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                Step::Wait(state)
            }

            CiprxgetRpl2 => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if self.cmd.this_arg_is("ok")
                    || self.cmd.this_arg_is("+ciprxget:")
                    || self.cmd.this_arg_is("+ipclose:")
                {
                    return Step::Wait(state);
                }
                let text = self.cmd.line();
                if !super::deferred::append_hex(&mut self.inbox, text) {
                    node_warn!("modem: reply is not hex");
                }
                self.process_received(env);
                Step::Wait(Idle)
            }

            MiscRpl => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                if self.cmd.this_arg_is("ok") {
                    return Step::Wait(Idle);
                }
                Step::Wait(state)
            }

            Idle | Complete => {
                if let Some(step) = self.common_reply(env, state) {
                    return step;
                }
                Step::Wait(Idle)
            }

            DfuBegin | DfuRpl0 | DfuRpl1 | DfuRpl2 | DfuRpl3 | DfuRpl4 | DfuRpl4A | DfuRpl5
            | DfuRpl5A(_) | DfuRpl6(_) | DfuValidate | DfuRpl7 | DfuRpl8(_) | DfuPrepare
            | DfuRpl9 => self.dfu_handle(env, state),
        }
    }

    fn reset_req(&mut self, env: &mut Env<'_>) -> Step {
        if env.deselected {
            return match self.reset_step(env, true) {
                Some(Step::Nested(_)) | None => Step::Wait(State::Idle),
                Some(step) => step,
            };
        }

        if self.first_reset {
            self.first_reset = false;
            node_info!("modem: initializing");
        } else {
            env.stats.resets = env.stats.resets.wrapping_add(1);
            node_info!("modem: reset");
        }

        self.watchdog_set = env.now;
        self.no_network = false;
        self.init_completed = false;
        self.init_in_progress = true;
        self.init_last_initiated = env.now;
        self.deferred.clear();
        self.awaiting_reply = false;
        self.extend_watchdog = false;
        if self.apn.is_empty() {
            self.apn = env.storage.carrier_apn.clone();
        }

        // Flow control off first, so that we can talk to the modem after
        // the reset no matter how it was left configured
        self.send(env, format_args!("at+cgfunc=11,0"));
        Step::Wait(State::CgfuncRpl1)
    }

    fn check_service(&mut self, env: &mut Env<'_>) -> Step {
        self.event(Event::ConnectState(ConnectState::WirelessService));
        self.send(env, format_args!("at+cpsi=5"));
        Step::Wait(State::CpsiRpl(Seen::NONE))
    }

    fn cpsi(&mut self, env: &mut Env<'_>, seen: Seen) -> Step {
        let state = State::CpsiRpl(seen);
        if let Some(step) = self.common_reply(env, state) {
            return step;
        }
        if self.no_network {
            return Step::Nested(State::InitCompleted);
        }

        let mut seen = seen;
        let mut retry = false;

        if self.cmd.this_arg_is("ok") {
            seen = seen.mark(0x01);
        } else if self.cmd.this_arg_is("+cpsi:") {
            self.cmd.next_arg();
            if self.cmd.this_arg_is("no service") {
                let waited = env.now.wrapping_sub(self.init_last_initiated);
                if waited < C::CELL_SERVICE_SECONDS {
                    node_debug!("modem: waiting for service ({=u32}s)", waited);
                    retry = true;
                } else {
                    node_warn!("modem: no service after {=u32}s", waited);
                    self.no_network = true;
                    return Step::Nested(State::InitCompleted);
                }
            } else {
                self.cmd.this_arg_is("*");
                let mut cpsi: String<64> = String::new();
                let _ = cpsi.push_str(self.cmd.next_arg());
                if self.cmd.this_arg_is("online") {
                    seen = seen.mark(0x02);
                    self.cmd.this_arg_is("*");
                    self.cmd.next_arg();
                    // mcc, mnc, lac, cell id
                    for _ in 0..4 {
                        self.cmd.this_arg_is("*");
                        let _ = write!(cpsi, ",{}", self.cmd.next_arg());
                    }
                    env.stats.cell_cpsi = cpsi;
                } else {
                    retry = true;
                }
            }
        }

        if seen.all(0x03) {
            self.send(env, format_args!("at+cpsi=0"));
            return Step::Wait(State::Cpsi0Rpl);
        }

        if retry {
            if env.deselected {
                if let Some(step) = self.reset_step(env, true) {
                    return step;
                }
            } else {
                self.watchdog_set = env.now;
            }
        }

        Step::Wait(State::CpsiRpl(seen))
    }

    fn netopen(&mut self, env: &mut Env<'_>, seen: Seen) -> Step {
        let state = State::NetopenRpl(seen);
        if let Some(step) = self.common_reply(env, state) {
            return step;
        }

        let mut seen = seen;
        if self.cmd.this_arg_is("ok") {
            seen = seen.mark(0x01);
        }
        if self.cmd.this_arg_is("+netopen: 0") {
            seen = seen.mark(0x02);
        }
        if self.cmd.this_arg_is("+netopen: 1") {
            // APN rejected, or no data service yet; go back to waiting for it
            self.extend_watchdog = false;
            node_info!("modem: waiting for network");
            return self.check_service(env);
        }
        if !seen.all(0x03) {
            return Step::Wait(State::NetopenRpl(seen));
        }

        self.extend_watchdog = false;

        // Re-resolve now and then in case the service moved
        let refresh = match self.last_dns {
            Some(at) => env.now.wrapping_sub(at) >= C::DNS_REFRESH_SECONDS,
            None => true,
        };
        if refresh {
            self.udp_addr.clear();
            self.tcp_addr.clear();
            self.last_dns = Some(env.now);
        }
        if self.udp_addr.is_empty() {
            self.udp_addr = env.storage.service_udp.clone();
        }
        if self.tcp_addr.is_empty() {
            self.tcp_addr = env.storage.service_tcp.clone();
        }

        if !is_numeric_host(&self.udp_addr) || !is_numeric_host(&self.tcp_addr) {
            let host = self.udp_addr.clone();
            self.send(env, format_args!("at+cdnsgip=\"{}\"", host));
            return Step::Wait(State::CdnsgipRpl);
        }

        self.send(env, format_args!("at+ciphead=1"));
        Step::Wait(State::CipheadRpl)
    }

    fn init_completed(&mut self, env: &mut Env<'_>) -> Step {
        if !self.no_network {
            self.event(Event::ConnectState(ConnectState::FonaActive));
            self.event(Event::SelectCompleted);
        } else {
            self.event(Event::Shutdown);
            self.event(Event::OneshotCompleted);
        }
        self.init_in_progress = false;
        self.init_completed = true;

        if self.dfu.in_progress {
            if self.no_network {
                return self.dfu_terminate(env, crate::config::DfuError::NoNetwork);
            }
            return Step::Nested(State::DfuBegin);
        }

        if !self.no_network {
            node_info!("modem: online");
            // Never fall back to another transport after a transient failure
            self.lock = true;
            self.event(Event::UpdateService);
        } else {
            node_info!("modem: no network");
        }
        Step::Wait(State::Idle)
    }

    fn cipopen(&mut self, env: &mut Env<'_>, seen: Seen) -> Step {
        let state = State::CipopenRpl2(seen);
        if let Some(step) = self.common_reply(env, state) {
            return step;
        }

        let mut seen = seen;
        if self.cmd.this_arg_is("ok") {
            self.watchdog_set = env.now;
        } else if self.cmd.this_arg_is("+cipopen: 1,0") {
            seen = seen.mark(0x01);
        } else if self.cmd.this_arg_is("+cipopen:") {
            if self.open_retries == 0 {
                node_warn!("modem: service unreachable");
                return Step::Wait(State::Idle);
            }
            self.open_retries -= 1;
            node_info!("modem: open failure, retrying");
            // Fall back to the configured host, and resolve again next time
            self.tcp_addr = env.storage.service_tcp.clone();
            self.last_dns = None;
            self.event(Event::ConnectState(ConnectState::AppService));
            self.send_open(env);
            self.watchdog_set = env.now;
            return Step::Wait(State::CipopenRpl2(Seen::NONE));
        }

        if seen.all(0x01) {
            self.event(Event::ConnectState(ConnectState::Unknown));
            self.deferred.arm(true);
            self.extend_watchdog = true;
            let len = self.deferred.len();
            self.send(env, format_args!("at+cipsend=1,{}", len));
            return Step::Wait(State::CipsendRpl(Seen::NONE));
        }

        Step::Wait(State::CipopenRpl2(seen))
    }
}
