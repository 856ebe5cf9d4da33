//! Counters and identity strings reported to the service

use heapless::String;

/// Flat record of node counters
///
/// Incremented in place by whichever component noticed the event, and
/// periodically sent to the service as a stats report.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Bytes handed to a transport
    pub transmitted: u32,
    /// Bytes received from the service
    pub received: u32,
    /// Modem re-initializations after the first
    pub resets: u32,
    /// Spontaneous modem reboots outside of the service check
    pub power_fails: u32,
    /// Spontaneous modem reboots during the service check
    pub ant_fails: u32,
    /// Oneshot sessions started
    pub oneshots: u32,
    /// Average seconds to complete a transport select
    pub oneshot_seconds: u32,
    /// Modem protocol errors and watchdog expiries
    pub errors_fona: u32,
    /// Failed selects while the LoRa radio was attaching
    pub errors_connect_lora: u32,
    /// Failed selects while the modem was powering up
    pub errors_connect_fona: u32,
    /// Failed selects while waiting on a gateway
    pub errors_connect_gateway: u32,
    /// Failed selects while waiting on carrier service
    pub errors_connect_wireless: u32,
    /// Failed selects while opening the data session
    pub errors_connect_data: u32,
    /// Failed selects while contacting the service
    pub errors_connect_service: u32,
    /// Sensor measurements that failed or timed out
    pub errors_sensor: u32,
    /// SIM ICCID
    pub cell_iccid: String<24>,
    /// `sysmode,mcc,mnc,lac,cellid` of the serving cell
    pub cell_cpsi: String<64>,
    /// Modem model string
    pub module_fona: String<32>,
}

impl Stats {
    /// Create an all-zero record
    pub const fn new() -> Self {
        Self {
            transmitted: 0,
            received: 0,
            resets: 0,
            power_fails: 0,
            ant_fails: 0,
            oneshots: 0,
            oneshot_seconds: 0,
            errors_fona: 0,
            errors_connect_lora: 0,
            errors_connect_fona: 0,
            errors_connect_gateway: 0,
            errors_connect_wireless: 0,
            errors_connect_data: 0,
            errors_connect_service: 0,
            errors_sensor: 0,
            cell_iccid: String::new(),
            cell_cpsi: String::new(),
            module_fona: String::new(),
        }
    }
}

/// Replace the contents of `dst` with as much of `src` as fits
pub(crate) fn set_str<const N: usize>(dst: &mut String<N>, src: &str) {
    dst.clear();
    for c in src.chars() {
        if dst.push(c).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_str_truncates() {
        let mut s: String<4> = String::new();
        set_str(&mut s, "abcdef");
        assert_eq!(s.as_str(), "abcd");
        set_str(&mut s, "x");
        assert_eq!(s.as_str(), "x");
    }
}
