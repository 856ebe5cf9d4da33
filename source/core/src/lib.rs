//! # TTNode Core
//!
//! This is the firmware core of a battery powered environmental sensing node.
//! The node periodically samples a set of sensors (radiation, air quality,
//! temperature/humidity/pressure, fuel gauge, motion, GPS) and relays the
//! results to a backend service over a cellular modem, or over any other
//! wide-area transport that implements [comm::Transport].
//!
//! Nothing in here blocks, and nothing in here allocates. The whole node runs
//! as a single cooperative task, driven by a slow periodic tick.
//!
//! ## Layers
//!
//! From the wire upwards:
//!
//! 1. [cmdbuf::CmdBuf] turns the byte stream of a UART peripheral into lines,
//!    and lets a state machine classify the current line with
//!    `this_arg_is` / `next_arg`.
//! 2. [modem::Modem] drives an AT-command cellular modem through power-up,
//!    network attach, a one-message-at-a-time send/receive protocol, and an
//!    optional firmware download. It is a closed enum of states plus a
//!    transition function; "waiting for a reply" is just a stored state.
//! 3. [sched::Scheduler] time-shares the sensors and their power domains,
//!    honoring exclusivity classes and battery-aware repeat intervals.
//! 4. [comm::Comm] decides which transport is powered, runs "oneshot"
//!    sessions (power up, send, await one reply, power down), and fails over.
//! 5. [node::Node] owns all of the above and runs one tick: sensors first,
//!    then the transport, so that a measurement finished in this tick can be
//!    sent in this same tick.
//!
//! ## Time
//!
//! Every operation takes the current time as whole [Seconds] since boot,
//! rather than reading a clock. The async [node::Node::run] loop is the only
//! place that looks at [embassy_time::Instant], which keeps every state
//! machine deterministic under test.
//!
//! ## Recovery
//!
//! Errors are handled where they happen. A sensor that fails is counted and
//! skipped for the rest of its power cycle. A modem that misbehaves is reset,
//! first with the init handshake and then by power cycling. A modem that is
//! stuck in any non-idle state for longer than its watchdog ceiling is always
//! power cycled. Operators see failures only through [stats::Stats] and the
//! debug log.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod battery;
pub mod cmdbuf;
pub mod comm;
pub mod config;
pub mod modem;
pub mod node;
pub mod sched;
pub mod stats;
pub mod timer;
pub mod uart;
pub mod wire;

use crate::{config::Storage, stats::Stats, uart::Uart};

pub use crate::node::Node;

/// Whole seconds since boot
pub type Seconds = u32;

/// An error type for the [`ModemSerial`] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying hardware serial port
    Serial(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Serial(value)
    }
}

/// A trait representing the UART shared by the modem and UART sensors
pub trait ModemSerial {
    /// The error type of the underlying serial port
    type SerError;

    /// Write all of `data`, returning once it has been handed to the hardware
    async fn write(&mut self, data: &[u8]) -> Result<(), Error<Self::SerError>>;

    /// Receive at least one byte into `buf`, returning how many were received
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error<Self::SerError>>;
}

/// The context handed to every transport and comm operation
///
/// This bundles the pieces of node-wide state that used to be reached for
/// as globals: the clock, the persisted configuration record, the counters,
/// and the UART selection token.
pub struct Env<'a> {
    /// Current time
    pub now: Seconds,
    /// The address of this device, as reported to the service
    pub device_id: u32,
    /// Persisted configuration record
    pub storage: &'a mut Storage,
    /// Counters
    pub stats: &'a mut Stats,
    /// UART selection
    pub uart: &'a mut Uart,
    /// Whether comm is currently running power-up/send/power-down sessions
    pub oneshot: bool,
    /// Whether the transport being called is powered down by comm
    pub deselected: bool,
    /// Whether another transport can take over from the cellular modem
    pub fallback: bool,
}

impl<'a> Env<'a> {
    /// Build a context with comm in its boot state
    pub fn new(now: Seconds, storage: &'a mut Storage, stats: &'a mut Stats, uart: &'a mut Uart) -> Self {
        Self {
            now,
            device_id: 0,
            storage,
            stats,
            uart,
            oneshot: false,
            deselected: true,
            fallback: false,
        }
    }
}
