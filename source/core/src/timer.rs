//! Suppression intervals
//!
//! Most periodic work on the node is written as "do this unless it was done
//! less than N seconds ago". [Interval] remembers when it was last done.

use crate::Seconds;

/// When something was last done, if ever
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Interval {
    last: Option<Seconds>,
}

impl Interval {
    /// Never done, so never suppressed
    pub const fn never() -> Self {
        Self { last: None }
    }

    /// Last done at `at`
    pub const fn at(at: Seconds) -> Self {
        Self { last: Some(at) }
    }

    /// When it was last done
    pub fn last(&self) -> Option<Seconds> {
        self.last
    }

    /// Forget, so that the next check is not suppressed
    pub fn clear(&mut self) {
        self.last = None;
    }

    /// Record that it was done at `now`
    pub fn mark(&mut self, now: Seconds) {
        self.last = Some(now);
    }

    /// Would doing it at `now` be too soon after the last time?
    ///
    /// Nothing is suppressed if it was never done. A last time that is in
    /// the future does not suppress either.
    pub fn would_suppress(&self, now: Seconds, period: Seconds) -> bool {
        let Some(last) = self.last else {
            return false;
        };
        if now < period {
            return true;
        }
        now >= last && now - period < last
    }

    /// Like [Interval::would_suppress], but if not suppressed, records `now`
    pub fn should_suppress(&mut self, now: Seconds, period: Seconds) -> bool {
        if self.would_suppress(now, period) {
            return true;
        }
        self.last = Some(now);
        false
    }

    /// Like [Interval::should_suppress], but keeps to a fixed cadence
    ///
    /// The recorded time advances in whole periods from the previous one, so
    /// work that runs late does not push the whole schedule back.
    pub fn should_suppress_consistently(&mut self, now: Seconds, period: Seconds) -> bool {
        let prev = self.last;
        if self.should_suppress(now, period) {
            return true;
        }
        if let Some(prev) = prev {
            let mut next = prev.wrapping_add(period);
            if period != 0 && next < now {
                while next + period < now {
                    next += period;
                }
                self.last = Some(next);
            }
        }
        false
    }

    /// Seconds until it would no longer be suppressed, negative if overdue
    pub fn remaining(&self, now: Seconds, period: Seconds) -> i64 {
        match self.last {
            Some(last) => i64::from(last) + i64::from(period) - i64::from(now),
            None => 0,
        }
    }
}
