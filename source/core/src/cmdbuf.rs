//! Line/reply demultiplexer
//!
//! A [CmdBuf] turns the raw byte stream of a UART-attached peripheral into
//! complete lines, and lets a state machine classify the line it is currently
//! looking at with a sequence of [CmdBuf::this_arg_is] / [CmdBuf::next_arg]
//! calls.
//!
//! Completed lines wait in a small FIFO until the owning state machine gets
//! around to them, so two replies arriving back to back are never merged or
//! overwritten. If the FIFO is full, the newest line is dropped and counted.

use heapless::{Deque, Vec};

/// Longest line we accept. Anything this long is discarded.
pub const MAX_LINE: usize = 250;

/// Number of completed lines that may wait for processing
pub const LINE_QUEUE: usize = 8;

/// A single line of printable ASCII
pub type Line = Vec<u8, MAX_LINE>;

/// Accumulator of "which reply fragments have we seen" within one state.
///
/// Carried inside the state value itself, so moving to a different state
/// always starts from [Seen::NONE].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Seen(u8);

impl Seen {
    /// Nothing seen yet
    pub const NONE: Seen = Seen(0);

    /// Record the given fragment bits
    #[must_use]
    pub const fn mark(self, bits: u8) -> Seen {
        Seen(self.0 | bits)
    }

    /// Have all bits of `mask` been recorded?
    pub const fn all(self, mask: u8) -> bool {
        (self.0 & mask) == mask
    }

    /// Raw bits
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Per-peripheral receive buffer and protocol state holder
pub struct CmdBuf<S> {
    state: S,
    initialized: bool,
    partial: Line,
    ready: Deque<Line, LINE_QUEUE>,
    line: Line,
    complete: bool,
    args: usize,
    arg_end: usize,
    nextarg: usize,
    overflows: u32,
}

impl<S: Copy + PartialEq> CmdBuf<S> {
    /// Create an uninitialized buffer. Bytes are dropped until [CmdBuf::init].
    pub const fn new(state: S) -> Self {
        Self {
            state,
            initialized: false,
            partial: Vec::new(),
            ready: Deque::new(),
            line: Vec::new(),
            complete: false,
            args: 0,
            arg_end: 0,
            nextarg: 0,
            overflows: 0,
        }
    }

    /// Clear everything and start accepting bytes
    pub fn init(&mut self, state: S) {
        self.partial.clear();
        self.ready.clear();
        self.reset();
        self.state = state;
        self.initialized = true;
    }

    /// Feed one received byte
    ///
    /// Returns `true` if this byte completed a line.
    pub fn received_byte(&mut self, byte: u8) -> bool {
        if !self.initialized {
            return false;
        }

        match byte {
            b'\n' => {
                if self.partial.is_empty() {
                    // blank line
                    return false;
                }
                let line = core::mem::take(&mut self.partial);
                if self.ready.push_back(line).is_err() {
                    self.overflows = self.overflows.wrapping_add(1);
                    node_warn!("cmdbuf: line queue full, dropping line");
                    return false;
                }
                true
            }
            0x20..=0x7e => {
                // A line that runs to the limit is garbage, restart accumulation
                if self.partial.push(byte).is_err() || self.partial.len() >= MAX_LINE {
                    self.partial.clear();
                }
                false
            }
            _ => false,
        }
    }

    /// Move the oldest completed line into the "current" slot.
    ///
    /// Returns `false` if there was nothing waiting. A line that is already
    /// loaded and not yet [reset][CmdBuf::reset] stays loaded.
    pub fn load_next(&mut self) -> bool {
        if self.complete {
            return true;
        }
        match self.ready.pop_front() {
            Some(line) => {
                self.line = line;
                self.complete = true;
                self.args = 0;
                self.nextarg = 0;
                self.arg_end = self.line.len();
                true
            }
            None => false,
        }
    }

    /// Is a complete line loaded for classification?
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of completed lines still waiting behind the current one
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Number of lines dropped because the queue was full
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Discard the current line, ready for the next
    pub fn reset(&mut self) {
        self.line.clear();
        self.complete = false;
        self.args = 0;
        self.arg_end = 0;
        self.nextarg = 0;
    }

    /// Throw away the current line, any waiting lines, and any partial line
    pub fn flush(&mut self) {
        self.partial.clear();
        self.ready.clear();
        self.reset();
    }

    /// Current protocol state
    pub fn state(&self) -> S {
        self.state
    }

    /// Assign the protocol state. Buffers are left untouched.
    pub fn set_state(&mut self, state: S) {
        self.state = state;
    }

    /// The complete current line
    pub fn line(&self) -> &str {
        as_str(&self.line)
    }

    /// Everything from the current argument to end of line
    pub fn rest(&self) -> &str {
        as_str(self.line.get(self.args..).unwrap_or(&[]))
    }

    /// Test whether the current argument matches a lowercase `pattern`
    ///
    /// * `"abc"` matches the whole delimited word `abc` (any case)
    /// * `"abc*"` matches anything starting with `abc`
    /// * `"*"` matches any single token, which [CmdBuf::next_arg] then returns
    /// * a pattern containing a space treats spaces as part of the word
    pub fn this_arg_is(&mut self, pattern: &str) -> bool {
        let pat = pattern.as_bytes();
        let embedded_spaces = pat.contains(&b' ');
        let len = self.line.len();

        let (pat, test_for_word, token_mode) = match pat.split_last() {
            Some((&b'*', [])) => (&pat[..0], true, true),
            Some((&b'*', head)) => (head, false, false),
            _ => (pat, true, false),
        };

        self.nextarg = self.args;
        self.arg_end = len;

        if !token_mode {
            let remaining = len.saturating_sub(self.args);
            if pat.len() > remaining {
                return false;
            }
            let candidate = &self.line[self.args..self.args + pat.len()];
            if !candidate
                .iter()
                .zip(pat.iter())
                .all(|(c, p)| c.to_ascii_lowercase() == *p)
            {
                return false;
            }
            self.nextarg += pat.len();
            if pat.len() == remaining {
                return true;
            }
        }

        if token_mode {
            while self.nextarg < len && !is_separator(self.line[self.nextarg], embedded_spaces) {
                self.nextarg += 1;
            }
            self.arg_end = self.nextarg;
        }

        if test_for_word && self.nextarg < len {
            if !is_separator(self.line[self.nextarg], embedded_spaces) {
                return false;
            }
            let mut i = self.nextarg;
            while i < len && is_separator(self.line[i], embedded_spaces) {
                i += 1;
            }
            self.nextarg = i;
        }

        true
    }

    /// Return the argument matched by the last [CmdBuf::this_arg_is], and move
    /// the cursor past it
    pub fn next_arg(&mut self) -> &str {
        let start = self.args.min(self.line.len());
        let end = self.arg_end.clamp(start, self.line.len());
        self.args = self.nextarg;
        self.arg_end = self.line.len();
        as_str(&self.line[start..end])
    }
}

fn is_separator(byte: u8, embedded_spaces: bool) -> bool {
    match byte {
        b' ' => !embedded_spaces,
        b',' | b';' => true,
        0x20..=0x7e => false,
        _ => true,
    }
}

fn as_str(bytes: &[u8]) -> &str {
    // Lines only ever hold printable ASCII
    core::str::from_utf8(bytes).unwrap_or("")
}

#[cfg(test)]
mod test {
    use super::*;

    fn loaded(text: &str) -> CmdBuf<u8> {
        let mut cb = CmdBuf::new(0);
        cb.init(0);
        for b in text.bytes() {
            cb.received_byte(b);
        }
        cb.received_byte(b'\n');
        assert!(cb.load_next());
        cb
    }

    #[test]
    fn drops_bytes_before_init() {
        let mut cb = CmdBuf::new(0u8);
        for b in b"ok\r\n" {
            assert!(!cb.received_byte(*b));
        }
        assert!(!cb.load_next());
    }

    #[test]
    fn blank_lines_and_control_chars_ignored() {
        let mut cb = CmdBuf::new(0u8);
        cb.init(0);
        for b in b"\r\n\r\n\x01o\tk\r\n" {
            cb.received_byte(*b);
        }
        assert!(cb.load_next());
        assert_eq!(cb.line(), "ok");
        cb.reset();
        assert!(!cb.load_next());
    }

    #[test]
    fn lines_queue_in_order() {
        let mut cb = CmdBuf::new(0u8);
        cb.init(0);
        for b in b"start\r\n+cpin: ready\r\npb done\r\n" {
            cb.received_byte(*b);
        }
        let mut seen = std::vec::Vec::new();
        while cb.load_next() {
            seen.push(std::string::String::from(cb.line()));
            cb.reset();
        }
        assert_eq!(seen, ["start", "+cpin: ready", "pb done"]);
    }

    #[test]
    fn queue_overflow_drops_newest() {
        let mut cb = CmdBuf::new(0u8);
        cb.init(0);
        for i in 0..(LINE_QUEUE + 2) {
            cb.received_byte(b'a' + i as u8);
            cb.received_byte(b'\n');
        }
        assert_eq!(cb.overflows(), 2);
        assert!(cb.load_next());
        assert_eq!(cb.line(), "a");
        assert_eq!(cb.pending(), LINE_QUEUE - 1);
    }

    #[test]
    fn overlong_line_is_discarded() {
        let mut cb = CmdBuf::new(0u8);
        cb.init(0);
        for _ in 0..MAX_LINE {
            cb.received_byte(b'x');
        }
        cb.received_byte(b'o');
        cb.received_byte(b'k');
        cb.received_byte(b'\n');
        assert!(cb.load_next());
        assert_eq!(cb.line(), "ok");
    }

    #[test]
    fn word_match_is_case_insensitive_and_delimited() {
        let mut cb = loaded("OK");
        assert!(cb.this_arg_is("ok"));

        let mut cb = loaded("okay");
        assert!(!cb.this_arg_is("ok"));
        assert!(cb.this_arg_is("ok*"));
    }

    #[test]
    fn embedded_space_patterns() {
        let mut cb = loaded("+CPIN: READY");
        assert!(cb.this_arg_is("+cpin: ready"));
        let mut cb = loaded("PB DONE");
        assert!(cb.this_arg_is("pb done"));
        assert!(!cb.this_arg_is("pb don"));
    }

    #[test]
    fn token_walk() {
        let mut cb = loaded("+NETOPEN: 0");
        assert!(cb.this_arg_is("+netopen:"));
        assert_eq!(cb.next_arg(), "+NETOPEN: 0");
        assert!(cb.this_arg_is("*"));
        assert_eq!(cb.next_arg(), "0");

        let mut cb = loaded("+CDNSGIP: 1,\"tt.example.org\",\"10.1.2.3\"");
        assert!(cb.this_arg_is("+cdnsgip:"));
        cb.next_arg();
        assert!(cb.this_arg_is("1"));
        cb.next_arg();
        assert!(cb.this_arg_is("*"));
        assert_eq!(cb.next_arg(), "\"tt.example.org\"");
        assert!(cb.this_arg_is("*"));
        assert_eq!(cb.next_arg(), "\"10.1.2.3\"");
        assert_eq!(cb.rest(), "");
    }

    #[test]
    fn prefix_match_leaves_rest() {
        let mut cb = loaded("+IPD48");
        assert!(cb.this_arg_is("+ipd*"));
        cb.next_arg();
        assert_eq!(cb.rest(), "48");
    }

    #[test]
    fn seen_accumulates() {
        let s = Seen::NONE.mark(0x02);
        assert!(!s.all(0x03));
        let s = s.mark(0x01);
        assert!(s.all(0x03));
        assert_eq!(s.bits(), 0x03);
    }
}
