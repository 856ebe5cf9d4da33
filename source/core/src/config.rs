//! Configuration
//!
//! Two kinds of configuration live here:
//!
//! * [NodeCfg], a metadata trait with the timing constants of a particular
//!   build, in the same spirit as a board support crate picking its types.
//! * [Storage], the persisted record that can be changed at runtime (over
//!   the air, or over the debug console) and is committed with
//!   [StorageBackend::save].

use core::str::FromStr;

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_time::Duration;
use heapless::String;

use crate::Seconds;

/// Metadata trait to contain timing constants and relevant generics
pub trait NodeCfg {
    /// Mutex type used for channels shared with interrupt context
    type Mutex: RawMutex + 'static;

    /// Longest a transport may sit in a non-idle state
    const WATCHDOG_SECONDS: Seconds = 60;

    /// Ceiling used while a known-long operation (file download) runs
    const WATCHDOG_EXTENDED_SECONDS: Seconds = 300;

    /// Time after boot before the first transport is initialized
    const BOOT_DELAY_SECONDS: Seconds = 30;

    /// How long the modem waits for carrier service before giving up
    const CELL_SERVICE_SECONDS: Seconds = 240;

    /// A deferred send outstanding for longer than this is abandoned
    const DEFERRED_STALE_SECONDS: Seconds = 60;

    /// A oneshot session idle for this long is powered down
    const ONESHOT_UPDATE_SECONDS: Seconds = 3 * 60;

    /// A oneshot session that can't reach the service for this long is aborted
    const ONESHOT_ABORT_SECONDS: Seconds = 5 * 60;

    /// Upper bound on the oneshot interval with a full battery
    const ONESHOT_FAST_MINUTES: u32 = 10;

    /// After failing over to cellular, restart the node this long afterwards
    /// to try the primary transport again
    const FAILOVER_RESTART_SECONDS: Seconds = 24 * 60 * 60;

    /// How often service host names are resolved again
    const DNS_REFRESH_SECONDS: Seconds = 48 * 60 * 60;

    /// How long to wait for a first GPS fix while a location update is pending
    const GPS_ABORT_FIRST_SECONDS: Seconds = 15 * 60;

    /// How long to wait to improve an existing GPS fix
    const GPS_ABORT_IMPROVE_SECONDS: Seconds = 3 * 60;

    /// A sensor measurement pending for longer than this is force-completed
    const MEASURE_DEADLINE_SECONDS: Seconds = 2 * 60;

    /// Tick period while a timing sensitive mode is active
    const FAST_TICK: Duration = Duration::from_secs(5);

    /// Normal tick period
    const SLOW_TICK: Duration = Duration::from_secs(15);

    /// Whether the modem UART uses hardware flow control
    const HW_FLOW_CONTROL: bool = false;

    /// Whether a downloaded firmware image is read back before handoff
    const DFU_VALIDATE: bool = false;
}

/// The stock timing constants
pub struct DefaultCfg;

impl NodeCfg for DefaultCfg {
    type Mutex = CriticalSectionRawMutex;
}

/// Wide-area network policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum WanMode {
    /// Cellular for the GPS fix, then LoRa, falling over to cellular oneshots
    Auto,
    /// LoRa only
    Lora,
    /// LoRaWAN only
    LoraWan,
    /// Cellular only
    Fona,
    /// LoRa, then LoRaWAN
    LoraThenLoraWan,
    /// LoRaWAN, then LoRa
    LoraWanThenLora,
    /// No wide-area comms, used when working on sensors
    None,
    /// Cellular, allowing mobile mode
    FonaPlusMobile,
}

impl WanMode {
    /// Is this one of the LoRa-first policies?
    pub fn is_lora(self) -> bool {
        matches!(
            self,
            WanMode::Lora | WanMode::LoraWan | WanMode::LoraThenLoraWan | WanMode::LoraWanThenLora
        )
    }

    /// Is this one of the cellular-only policies?
    pub fn is_fona(self) -> bool {
        matches!(self, WanMode::Fona | WanMode::FonaPlusMobile)
    }
}

/// Firmware update request state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum DfuStatus {
    /// Nothing to do
    Idle,
    /// Download the image named by `dfu_filename` on the next cellular session
    Pending,
}

/// Why the last firmware update attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum DfuError {
    /// Completed normally
    None,
    /// A command in the download sequence failed
    Basic,
    /// The image could not be fetched
    GetFile,
    /// No network was available
    NoNetwork,
    /// Reading the image back failed
    Transfer,
    /// The modem was reset during the update
    Reset,
    /// Preparing the handoff to the bootloader failed
    Prepare,
}

/// A fixed position
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Location {
    /// Degrees, positive north
    pub lat: f32,
    /// Degrees, positive east
    pub lon: f32,
    /// Meters
    pub alt: f32,
}

/// Host name, or dotted quad
pub type HostName = String<32>;

/// The persisted configuration record
#[derive(Debug, Clone)]
pub struct Storage {
    /// Wide-area network policy
    pub wan: WanMode,
    /// Carrier APN; if empty it is derived from the SIM ICCID
    pub carrier_apn: String<32>,
    /// UDP service endpoint, for fire-and-forget reports
    pub service_udp: HostName,
    /// UDP service port
    pub service_udp_port: u16,
    /// TCP service endpoint, for requests that expect a reply
    pub service_tcp: HostName,
    /// TCP service port
    pub service_tcp_port: u16,
    /// Firmware file server
    pub service_ftp: HostName,
    /// Firmware file server port
    pub service_ftp_port: u16,
    /// Firmware file server password
    pub ftp_password: String<32>,
    /// Firmware update request
    pub dfu_status: DfuStatus,
    /// Outcome of the last firmware update
    pub dfu_error: DfuError,
    /// Number of successful firmware updates
    pub dfu_count: u16,
    /// Directory of the image on the file server
    pub dfu_filename: String<32>,
    /// Statically configured position, which disables the GPS
    pub static_gps: Option<Location>,
    /// Last known good position
    pub lkg_gps: Option<Location>,
    /// Per-group overrides, `name.r=<minutes>` separated by `/`
    pub sensor_params: String<100>,
    /// Oneshot interval; zero keeps the transport powered continuously
    pub oneshot_minutes: u16,
    /// Interval of stats reports to the service
    pub stats_minutes: u16,
    /// Products present on this board, matched against group product masks
    pub products: u32,
    /// Sensors enabled on this board, matched against sensor masks
    pub sensors: u32,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            wan: WanMode::Fona,
            carrier_apn: String::new(),
            service_udp: host("tt-udp.safecast.org"),
            service_udp_port: 8081,
            service_tcp: host("tt.safecast.org"),
            service_tcp_port: 8082,
            service_ftp: host("tt-ftp.safecast.org"),
            service_ftp_port: 8083,
            ftp_password: String::new(),
            dfu_status: DfuStatus::Idle,
            dfu_error: DfuError::None,
            dfu_count: 0,
            dfu_filename: String::new(),
            static_gps: None,
            lkg_gps: None,
            sensor_params: String::new(),
            oneshot_minutes: 15,
            stats_minutes: 12 * 60,
            products: u32::MAX,
            sensors: u32::MAX,
        }
    }
}

fn host(name: &str) -> HostName {
    HostName::from_str(name).unwrap_or_default()
}

/// Where the [Storage] record is committed
pub trait StorageBackend {
    /// Persist `record`. If `force` is false, implementations may coalesce
    /// writes to save flash wear.
    fn save(&mut self, record: &Storage, force: bool);
}

/// An error while parsing configuration strings
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// An entry was not of the form `name.key=value`
    Malformed,
    /// A value was not a number
    BadNumber,
}

/// Look for a `<group>.r=<minutes>` entry in a `/`-separated parameter string
///
/// Returns `Ok(None)` if there is no entry for `group`.
pub fn repeat_override(params: &str, group: &str) -> Result<Option<Seconds>, ConfigError> {
    for entry in params.split('/').map(str::trim).filter(|e| !e.is_empty()) {
        let (lhs, value) = entry.split_once('=').ok_or(ConfigError::Malformed)?;
        let (name, key) = lhs.split_once('.').ok_or(ConfigError::Malformed)?;
        if !name.eq_ignore_ascii_case(group) || key != "r" {
            continue;
        }
        let minutes: u32 = value.trim().parse().map_err(|_| ConfigError::BadNumber)?;
        return Ok(Some(minutes.saturating_mul(60)));
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repeat_override_parses() {
        assert_eq!(repeat_override("", "g-geiger"), Ok(None));
        assert_eq!(repeat_override("g-geiger.r=5", "g-geiger"), Ok(Some(300)));
        assert_eq!(
            repeat_override("g-pms.r=1/g-geiger.r=10", "g-geiger"),
            Ok(Some(600))
        );
        assert_eq!(repeat_override("g-pms.r=1", "g-geiger"), Ok(None));
    }

    #[test]
    fn repeat_override_rejects_garbage() {
        assert_eq!(
            repeat_override("g-geiger", "g-geiger"),
            Err(ConfigError::Malformed)
        );
        assert_eq!(
            repeat_override("g-geiger.r=soon", "g-geiger"),
            Err(ConfigError::BadNumber)
        );
    }

    #[test]
    fn default_record_has_service_hosts() {
        let s = Storage::default();
        assert_eq!(s.service_udp.as_str(), "tt-udp.safecast.org");
        assert_eq!(s.dfu_status, DfuStatus::Idle);
        assert!(s.wan.is_fona());
    }
}
