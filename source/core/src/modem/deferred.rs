//! The single outstanding send/receive slot

use heapless::Vec;

use crate::{
    comm::{ReplyType, SendError},
    Seconds,
};

/// Largest payload the modem will accept in one send
pub const MTU: usize = 1480;

const DEFERRED_MAX: usize = MTU + 256;

/// At most one large-payload operation per modem
///
/// The payload is held here from [Deferred::claim] until the modem asks for
/// it with the `>` marker. Nothing else may claim the slot until it is
/// released, either after the payload went out or after the reply came back.
pub(crate) struct Deferred {
    buf: Vec<u8, DEFERRED_MAX>,
    active_since: Option<Seconds>,
    reply: ReplyType,
    armed: bool,
    ready: bool,
    done_after: bool,
}

impl Deferred {
    pub(crate) const fn new() -> Self {
        Self {
            buf: Vec::new(),
            active_since: None,
            reply: ReplyType::None,
            armed: false,
            ready: false,
            done_after: false,
        }
    }

    /// Take the slot for `data`. The existing contents are untouched on error.
    pub(crate) fn claim(
        &mut self,
        now: Seconds,
        data: &[u8],
        reply: ReplyType,
    ) -> Result<(), SendError> {
        if self.active_since.is_some() {
            return Err(SendError::DeferredActive);
        }
        if data.len() > DEFERRED_MAX {
            return Err(SendError::TooLarge);
        }
        self.buf.clear();
        self.buf
            .extend_from_slice(data)
            .map_err(|_| SendError::TooLarge)?;
        self.active_since = Some(now);
        self.reply = reply;
        Ok(())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    pub(crate) fn release(&mut self) {
        self.active_since = None;
    }

    /// Abandon the slot if it has been held for longer than `stale` seconds
    pub(crate) fn expire(&mut self, now: Seconds, stale: Seconds) -> bool {
        match self.active_since {
            Some(since) if now.wrapping_sub(since) >= stale => {
                self.active_since = None;
                true
            }
            _ => false,
        }
    }

    /// Wait for the `>` marker. If `done_after`, sending the payload ends the
    /// operation.
    pub(crate) fn arm(&mut self, done_after: bool) {
        self.armed = true;
        self.ready = false;
        self.done_after = done_after;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub(crate) fn take_ready(&mut self) -> bool {
        core::mem::take(&mut self.ready)
    }

    /// The payload has been handed to the UART. Returns whether that
    /// completed the operation.
    pub(crate) fn sent(&mut self) -> bool {
        self.armed = false;
        if self.done_after {
            self.done_after = false;
            self.active_since = None;
            true
        } else {
            false
        }
    }

    /// Forget any operation and any pending callback
    pub(crate) fn clear(&mut self) {
        self.active_since = None;
        self.armed = false;
        self.ready = false;
        self.done_after = false;
    }

    pub(crate) fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Append `text` to `dst` if and only if every non-whitespace character is
/// part of a hex pair. Whitespace is dropped.
pub(crate) fn append_hex<const N: usize>(dst: &mut Vec<u8, N>, text: &str) -> bool {
    let digits = || text.bytes().filter(|b| *b > b' ');
    let count = digits().count();
    if count % 2 != 0 || !digits().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    for b in digits() {
        if dst.push(b).is_err() {
            break;
        }
    }
    true
}
