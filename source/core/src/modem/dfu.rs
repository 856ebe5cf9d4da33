//! Firmware download over the modem's FTP client
//!
//! The image is fetched into the modem's own filesystem, optionally streamed
//! back over the UART to check that it is readable, and then left for the
//! bootloader. Any failure is recorded in storage and ends with a restart.

use crate::{
    cmdbuf::Seen,
    comm::Event,
    config::{DfuError, DfuStatus, NodeCfg},
    Env,
};

use super::{
    state::{State, Step},
    Modem,
};

const DFU_INFO: &str = "dfu.dat";
const DFU_IMAGE: &str = "dfu.bin";
const GETFILE_RETRIES: u8 = 10;

pub(crate) struct Dfu {
    pub(crate) in_progress: bool,
    retries: u8,
    packets: u32,
    bytes: u32,
}

impl Dfu {
    pub(crate) const fn new() -> Self {
        Self {
            in_progress: false,
            retries: 0,
            packets: 0,
            bytes: 0,
        }
    }
}

impl<C: NodeCfg> Modem<C> {
    /// End a download, recording how it went. Always lands in idle.
    pub(crate) fn dfu_terminate(&mut self, env: &mut Env<'_>, err: DfuError) -> Step {
        if self.dfu.in_progress {
            let storage = &mut *env.storage;
            storage.dfu_status = DfuStatus::Idle;
            storage.dfu_error = err;
            if err == DfuError::None {
                storage.dfu_count = storage.dfu_count.wrapping_add(1);
                node_info!(
                    "dfu: completed, {=u32} packets {=u32} bytes",
                    self.dfu.packets,
                    self.dfu.bytes
                );
            } else {
                node_error!("dfu: failed with {}", err);
            }
            self.dfu.in_progress = false;
            self.extend_watchdog = false;
            self.event(Event::SaveStorage { force: true });
            self.event(Event::RestartRequested);
        }
        Step::Wait(State::Idle)
    }

    /// The download states
    pub(crate) fn dfu_handle(&mut self, env: &mut Env<'_>, state: State) -> Step {
        use State::*;

        match state {
            DfuBegin => {
                self.dfu.packets = 0;
                self.dfu.bytes = 0;
                // Clear the marker the bootloader looks for
                self.send(env, format_args!("at+fsdel=\"{}\"", DFU_INFO));
                Step::Wait(DfuRpl0)
            }

            DfuRpl0 => {
                // The delete normally fails, as there was nothing to delete
                let host = env.storage.service_ftp.clone();
                self.send(env, format_args!("at+cftpserv=\"{}\"", host));
                Step::Wait(DfuRpl1)
            }

            DfuRpl1 => {
                let port = env.storage.service_ftp_port;
                self.dfu_on_ok(env, format_args!("at+cftpport={}", port), DfuRpl2)
            }

            DfuRpl2 => {
                let user = env.device_id;
                self.dfu_on_ok(env, format_args!("at+cftpun=\"{}\"", user), DfuRpl3)
            }

            DfuRpl3 => {
                let password = env.storage.ftp_password.clone();
                self.dfu_on_ok(env, format_args!("at+cftppw=\"{}\"", password), DfuRpl4)
            }

            DfuRpl4 => self.dfu_on_ok(env, format_args!("at+fsdel=\"{}\"", DFU_INFO), DfuRpl4A),

            DfuRpl4A => {
                self.send(env, format_args!("at+fsdel=\"{}\"", DFU_IMAGE));
                Step::Wait(DfuRpl5)
            }

            DfuRpl5 => {
                self.dfu.retries = 0;
                self.getfile(env, DFU_IMAGE);
                Step::Wait(DfuRpl5A(Seen::NONE))
            }

            DfuRpl5A(seen) => {
                if self.common_reply(env, state).is_some() {
                    return self.dfu_terminate(env, DfuError::Basic);
                }
                let mut seen = seen;
                if self.cmd.this_arg_is("+cftpgetfile:") {
                    if self.cmd.this_arg_is("+cftpgetfile: 0") {
                        seen = seen.mark(0x02);
                    } else {
                        // The first attempt often fails before the FTP session is up
                        self.dfu.retries += 1;
                        if self.dfu.retries > GETFILE_RETRIES {
                            return self.dfu_terminate(env, DfuError::GetFile);
                        }
                        node_info!("dfu: retrying download");
                        self.getfile(env, DFU_IMAGE);
                        return Step::Wait(DfuRpl5A(seen));
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    seen = seen.mark(0x01);
                }
                if seen.all(0x03) {
                    self.getfile(env, DFU_INFO);
                    return Step::Wait(DfuRpl6(Seen::NONE));
                }
                Step::Wait(DfuRpl5A(seen))
            }

            DfuRpl6(seen) => {
                if self.common_reply(env, state).is_some() {
                    return self.dfu_terminate(env, DfuError::Basic);
                }
                let mut seen = seen;
                if self.cmd.this_arg_is("+cftpgetfile:") {
                    if !self.cmd.this_arg_is("+cftpgetfile: 0") {
                        return self.dfu_terminate(env, DfuError::GetFile);
                    }
                    seen = seen.mark(0x02);
                }
                if self.cmd.this_arg_is("ok") {
                    seen = seen.mark(0x01);
                }
                if seen.all(0x03) {
                    self.extend_watchdog = false;
                    return Step::Nested(DfuValidate);
                }
                Step::Wait(DfuRpl6(seen))
            }

            DfuValidate => {
                if !C::DFU_VALIDATE {
                    return Step::Nested(DfuPrepare);
                }
                // Route the file transfer to our UART
                self.send(env, format_args!("at+catr=1"));
                Step::Wait(DfuRpl7)
            }

            DfuRpl7 => {
                if self.common_reply(env, state).is_some() {
                    return self.dfu_terminate(env, DfuError::Basic);
                }
                if !self.cmd.this_arg_is("ok") {
                    return Step::Wait(state);
                }
                self.extend_watchdog = true;
                self.send(env, format_args!("at+cftrantx=\"c:/{}\"", DFU_IMAGE));
                Step::Wait(DfuRpl8(Seen::NONE))
            }

            DfuRpl8(seen) => {
                if self.common_reply(env, state).is_some() {
                    return self.dfu_terminate(env, DfuError::Transfer);
                }
                let mut seen = seen;
                if self.cmd.this_arg_is("+cftrantx:") {
                    if self.cmd.this_arg_is("+cftrantx: 0") {
                        seen = seen.mark(0x02);
                    } else if self.cmd.this_arg_is("+cftrantx: data") {
                        self.cmd.next_arg();
                        self.cmd.this_arg_is("*");
                        let len: u32 = self.cmd.next_arg().parse().unwrap_or(0);
                        self.dfu.bytes = self.dfu.bytes.wrapping_add(len);
                        self.dfu.packets = self.dfu.packets.wrapping_add(1);
                        self.watchdog_set = env.now;
                    } else {
                        return self.dfu_terminate(env, DfuError::Transfer);
                    }
                }
                if self.cmd.this_arg_is("ok") {
                    seen = seen.mark(0x01);
                }
                if seen.all(0x03) {
                    node_info!("dfu: image is valid");
                    self.extend_watchdog = false;
                    return Step::Nested(DfuPrepare);
                }
                Step::Wait(DfuRpl8(seen))
            }

            DfuPrepare => {
                self.send(env, format_args!("at+fsls"));
                Step::Wait(DfuRpl9)
            }

            DfuRpl9 => self.dfu_terminate(env, DfuError::None),

            _ => Step::Wait(state),
        }
    }

    fn dfu_on_ok(&mut self, env: &mut Env<'_>, next_cmd: core::fmt::Arguments<'_>, next: State) -> Step {
        let state = self.cmd.state();
        if self.common_reply(env, state).is_some() {
            return self.dfu_terminate(env, DfuError::Basic);
        }
        if self.cmd.this_arg_is("ok") {
            self.send(env, next_cmd);
            return Step::Wait(next);
        }
        Step::Wait(state)
    }

    fn getfile(&mut self, env: &mut Env<'_>, file: &str) {
        let dir = env.storage.dfu_filename.clone();
        self.send(env, format_args!("at+cftpgetfile=\"/{}/{}\",0", dir, file));
        // Fetching a file takes a long time
        self.extend_watchdog = true;
    }
}
