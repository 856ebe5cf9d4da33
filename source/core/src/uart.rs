//! The "current UART selection" token
//!
//! One UART is shared by the cellular modem and any UART-attached sensors.
//! Whoever holds the selection owns the bytes; everyone else must treat any
//! callback that arrives for them as stale.

/// Who currently owns the shared UART
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum UartOwner {
    /// Nobody, the UART is powered down
    None,
    /// The cellular modem
    Cell,
    /// The LoRa radio
    Lora,
    /// A UART sensor, by its group index
    Sensor(u8),
}

/// Holder of the UART selection
#[derive(Debug)]
pub struct Uart {
    owner: UartOwner,
    switches: u32,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    /// Start with nobody selected
    pub const fn new() -> Self {
        Self {
            owner: UartOwner::None,
            switches: 0,
        }
    }

    /// Unconditionally hand the UART to `owner`
    pub fn select(&mut self, owner: UartOwner) {
        if self.owner != owner {
            node_debug!("uart: selection changed");
            self.switches = self.switches.wrapping_add(1);
        }
        self.owner = owner;
    }

    /// Take the UART if nobody holds it. Returns whether `owner` holds it now.
    pub fn claim(&mut self, owner: UartOwner) -> bool {
        match self.owner {
            UartOwner::None => {
                self.select(owner);
                true
            }
            o => o == owner,
        }
    }

    /// Give up the UART, if `owner` holds it
    pub fn release(&mut self, owner: UartOwner) {
        if self.owner == owner {
            self.select(UartOwner::None);
        }
    }

    /// Current owner
    pub fn owner(&self) -> UartOwner {
        self.owner
    }

    /// Does `owner` hold the UART?
    pub fn is_selected(&self, owner: UartOwner) -> bool {
        self.owner == owner
    }

    /// Number of ownership changes since boot
    pub fn switches(&self) -> u32 {
        self.switches
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claim_only_when_free() {
        let mut u = Uart::new();
        assert!(u.claim(UartOwner::Sensor(2)));
        assert!(!u.claim(UartOwner::Cell));
        assert!(u.claim(UartOwner::Sensor(2)));
        u.release(UartOwner::Cell);
        assert!(u.is_selected(UartOwner::Sensor(2)));
        u.release(UartOwner::Sensor(2));
        assert!(u.claim(UartOwner::Cell));
        assert_eq!(u.switches(), 3);
    }
}
