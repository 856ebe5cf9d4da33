//! Replies that mean the same thing in every state

use crate::{
    comm::Event,
    config::NodeCfg,
    stats::set_str,
    Env,
};

use super::{
    gps::{self, Fix},
    state::{State, Step},
    Modem,
};

/// Carrier access point names, by SIM ICCID prefix
const APN_BY_ICCID: &[(&str, &str, &str)] = &[
    ("890126", "Twilio", "wireless.twilio.com"),
    ("891030", "Soracom Beta", "openroamer.com"),
    ("894230", "Soracom", "soracom.io"),
    ("890117", "AT&T", "m2m005267.attz"),
];

/// Map a SIM ICCID to its carrier name and APN
pub(crate) fn apn_for_iccid(iccid: &str) -> Option<(&'static str, &'static str)> {
    APN_BY_ICCID
        .iter()
        .find(|(prefix, _, _)| iccid.starts_with(prefix))
        .map(|(_, carrier, apn)| (*carrier, *apn))
}

/// Is this a dotted quad rather than a host name?
pub(crate) fn is_numeric_host(host: &str) -> bool {
    host.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

impl<C: NodeCfg> Modem<C> {
    /// Look at the current line for transport-wide conditions
    ///
    /// Returns the step to take if the line was claimed, in which case the
    /// state handler must not look at it any further.
    pub(crate) fn common_reply(&mut self, env: &mut Env<'_>, state: State) -> Option<Step> {
        if self.cmd.this_arg_is("error") {
            node_warn!("modem: error in {}", state);
            // Sessions may still be open inside the modem
            self.force_full_reset = true;
            return Some(Step::Nested(State::ResetReq));
        }

        if self.cmd.this_arg_is("start") && !matches!(state, State::Idle) {
            node_warn!("modem: spontaneous reset in {}", state);
            if self.recording_stats {
                if matches!(state, State::CpsiRpl(_)) {
                    env.stats.ant_fails = env.stats.ant_fails.wrapping_add(1);
                } else {
                    env.stats.power_fails = env.stats.power_fails.wrapping_add(1);
                }
                env.stats.errors_fona = env.stats.errors_fona.wrapping_add(1);
            }
            return Some(Step::Nested(State::StartRpl));
        }

        if self.cmd.this_arg_is("+ipd*") {
            self.cmd.next_arg();
            self.cmd.this_arg_is("*");
            let len: usize = self.cmd.next_arg().parse().unwrap_or(0);
            let len = len.min(crate::cmdbuf::MAX_LINE);
            self.inbox.clear();
            self.send(env, format_args!("at+ciprxget=3,1,{}", len));
            return Some(Step::Wait(State::CiprxgetRpl2));
        }

        if self.cmd.this_arg_is("+ciperror:") {
            self.cmd.next_arg();
            node_warn!("modem: ciperror {=str}", self.cmd.rest());
            self.force_full_reset = true;
            return Some(Step::Nested(State::ResetReq));
        }

        if self.cmd.this_arg_is("+cme") {
            self.cmd.next_arg();
            if self.cmd.this_arg_is("error:") {
                self.cmd.next_arg();
                let why = self.cmd.rest();
                if why.starts_with("SIM failure") {
                    self.no_network = true;
                } else if why.starts_with("SIM busy") {
                    // transient, the modem retries on its own
                } else {
                    node_warn!("modem: cme error {=str}", why);
                }
            }
            return Some(Step::Wait(state));
        }

        if self.cmd.this_arg_is("+iccid:") {
            self.cmd.next_arg();
            let iccid = self.cmd.rest();
            set_str(&mut env.stats.cell_iccid, iccid);
            match apn_for_iccid(iccid) {
                Some((_carrier, apn)) => {
                    node_info!("modem: sim {=str} {=str}", _carrier, iccid);
                    set_str(&mut self.apn, apn);
                }
                None if self.apn.is_empty() => {
                    node_warn!("modem: unrecognized sim {=str}", iccid);
                }
                None => {}
            }
            return Some(Step::Wait(state));
        }

        if self.cmd.this_arg_is("+cgpsinfo:*") {
            self.cmd.next_arg();
            self.gps.data_parsed = true;
            match gps::parse_info(self.cmd.rest()) {
                Fix::Full(loc) => {
                    // Only the first fix, or one explicitly asked for, is kept
                    if !self.gps.have_location || self.gps.update_location {
                        env.storage.lkg_gps = Some(loc);
                        self.event(Event::SaveStorage { force: false });
                    }
                    self.gps.location = Some(loc);
                    self.gps.have_location = true;
                    self.gps.update_location = false;
                    self.gps_shutdown(env);
                }
                Fix::Partial => self.gps.partial = true,
                Fix::None => {}
            }
            return Some(Step::Wait(state));
        }

        None
    }

    /// Handle "ok" from a simple command by sending the next one
    pub(crate) fn on_ok(
        &mut self,
        env: &mut Env<'_>,
        state: State,
        next_cmd: core::fmt::Arguments<'_>,
        next: State,
    ) -> Step {
        if let Some(step) = self.common_reply(env, state) {
            return step;
        }
        if self.cmd.this_arg_is("ok") {
            self.send(env, next_cmd);
            return Step::Wait(next);
        }
        Step::Wait(state)
    }

    /// Parse `+cdnsgip: 1,"host","a.b.c.d"` into `tcp` or udp address
    pub(crate) fn dns_reply(&mut self, tcp: bool) -> bool {
        if !self.cmd.this_arg_is("+cdnsgip: *") {
            return false;
        }
        self.cmd.next_arg();
        self.cmd.this_arg_is("*");
        let ok = self.cmd.next_arg() == "1";
        self.cmd.this_arg_is("*");
        let _from = self.cmd.next_arg();
        self.cmd.this_arg_is("*");
        if ok {
            let to = self.cmd.next_arg().trim_matches('"');
            let dst = if tcp { &mut self.tcp_addr } else { &mut self.udp_addr };
            set_str(dst, to);
        }
        true
    }
}
