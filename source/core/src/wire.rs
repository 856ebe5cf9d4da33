//! Messages exchanged with the service, and their wire format
//!
//! Every message is a postcard-rpc [WireHeader] followed by a postcard body.
//! Outbound messages go out as raw bytes; the modem hands inbound ones back
//! as hex text.

use postcard::experimental::schema::Schema;
use postcard_rpc::{Topic, WireHeader};
use serde::{Deserialize, Serialize};

/// A borrowed view of a frame that contains a postcard-rpc message.
pub struct WhBody<'a> {
    /// The postcard-rpc Wire Header
    pub wh: WireHeader,
    /// The body of the frame
    pub body: &'a [u8],
}

impl<'a> WhBody<'a> {
    /// Attempt to split a decoded frame into header and body
    pub fn try_from(frame: &'a [u8]) -> Option<Self> {
        let (wh, body) = postcard_rpc::headered::extract_header_from_bytes(frame).ok()?;
        Some(WhBody { wh, body })
    }
}

/// One set of sensor readings, as uploaded after a measurement round
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize, Schema)]
pub struct Report {
    /// Reporting node
    pub device_id: u32,
    /// Battery status bits at the time of the report
    pub status: u16,
    /// Position
    pub latitude: Option<f32>,
    /// Position
    pub longitude: Option<f32>,
    /// Position
    pub altitude: Option<f32>,
    /// Battery state of charge, percent
    pub bat_soc: Option<f32>,
    /// Battery voltage
    pub bat_voltage: Option<f32>,
    /// Battery current, mA
    pub bat_current: Option<f32>,
    /// Ambient temperature, C
    pub env_temp: Option<f32>,
    /// Relative humidity, percent
    pub env_humid: Option<f32>,
    /// Barometric pressure, Pa
    pub env_press: Option<f32>,
    /// First geiger tube, counts per minute
    pub cpm0: Option<u32>,
    /// Second geiger tube, counts per minute
    pub cpm1: Option<u32>,
    /// Whether the node moved since the last report
    pub motion: Option<bool>,
}

/// Periodic health counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize, Schema)]
pub struct StatsReport {
    /// Reporting node
    pub device_id: u32,
    /// Seconds since boot
    pub uptime: u32,
    /// Bytes handed to a transport
    pub transmitted: u32,
    /// Bytes received from the service
    pub received: u32,
    /// Modem re-initializations
    pub resets: u32,
    /// Spontaneous modem reboots
    pub power_fails: u32,
    /// Spontaneous modem reboots while looking for service
    pub ant_fails: u32,
    /// Oneshot sessions started
    pub oneshots: u32,
    /// Average seconds to connect
    pub oneshot_seconds: u32,
    /// Modem protocol errors
    pub errors_fona: u32,
    /// Failed connects, all causes
    pub errors_connect: u32,
    /// Sensor failures
    pub errors_sensor: u32,
    /// Firmware updates completed
    pub dfu_count: u16,
}

/// Sender of a [Telecast]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Schema)]
pub enum DeviceType {
    /// Not specified
    Unknown,
    /// Another sensing node
    Node,
    /// A LoRa gateway
    Gateway,
    /// The service
    Service,
    /// A phone app
    App,
}

/// A message from anyone, usually the service replying to a request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Schema)]
pub struct Telecast {
    /// Who sent it
    pub device_type: DeviceType,
    /// Who it is about, or for
    pub device_id: u32,
    /// Ask the node to re-acquire its position
    pub gps_update: bool,
    /// Ask the node for a stats report on the next session
    pub stats_request: bool,
}

postcard_rpc::topic!(ReportTopic, Report, "ttnode/report");
postcard_rpc::topic!(StatsTopic, StatsReport, "ttnode/stats");
postcard_rpc::topic!(TelecastTopic, Telecast, "ttnode/telecast");

#[inline]
fn build_keyed<T: Serialize>(buf: &mut [u8], wh: &WireHeader, msg: &T) -> Option<usize> {
    let used1 = postcard::to_slice(wh, buf).ok()?.len();
    let (_hdr, remain) = buf.split_at_mut(used1);
    let used2 = postcard::to_slice(msg, remain).ok()?.len();
    Some(used1 + used2)
}

/// Serialize a `Topic` message into `buf`, returning the length used
pub fn send_topic<T>(buf: &mut [u8], seq_no: u32, msg: &T::Message) -> Option<usize>
where
    T: Topic,
    T::Message: Serialize,
{
    let wh = WireHeader {
        key: T::TOPIC_KEY,
        seq_no,
    };
    build_keyed::<T::Message>(buf, &wh, msg)
}

/// Decode hex text into `out`, returning the number of bytes written
///
/// Leading whitespace is skipped, and decoding stops at the first character
/// that is not part of a hex pair.
pub fn hex_decode(text: &[u8], out: &mut [u8]) -> usize {
    let start = text.iter().position(|b| *b > b' ').unwrap_or(text.len());
    let mut n = 0;
    for (pair, slot) in text[start..].chunks_exact(2).zip(out.iter_mut()) {
        let (Some(hi), Some(lo)) = (nibble(pair[0]), nibble(pair[1])) else {
            break;
        };
        *slot = (hi << 4) | lo;
        n += 1;
    }
    n
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex() {
        let mut out = [0u8; 8];
        assert_eq!(hex_decode(b"  00a1FF", &mut out), 3);
        assert_eq!(&out[..3], &[0x00, 0xa1, 0xff]);
        assert_eq!(hex_decode(b"12zz34", &mut out), 1);
        assert_eq!(hex_decode(b"123", &mut out), 1);
        assert_eq!(hex_decode(b"", &mut out), 0);
    }

    #[test]
    fn topic_frame_splits() {
        let msg = Telecast {
            device_type: DeviceType::Service,
            device_id: 7,
            gps_update: false,
            stats_request: true,
        };
        let mut buf = [0u8; 64];
        let used = send_topic::<TelecastTopic>(&mut buf, 3, &msg).unwrap();
        let frame = WhBody::try_from(&buf[..used]).unwrap();
        assert_eq!(frame.wh.key, TelecastTopic::TOPIC_KEY);
        assert_eq!(frame.wh.seq_no, 3);
        let back: Telecast = postcard::from_bytes(frame.body).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn report_fits_one_datagram() {
        let report = Report {
            device_id: u32::MAX,
            latitude: Some(1.0),
            longitude: Some(1.0),
            altitude: Some(1.0),
            bat_soc: Some(1.0),
            bat_voltage: Some(1.0),
            bat_current: Some(1.0),
            env_temp: Some(1.0),
            env_humid: Some(1.0),
            env_press: Some(1.0),
            cpm0: Some(u32::MAX),
            cpm1: Some(u32::MAX),
            motion: Some(true),
            ..Default::default()
        };
        let mut buf = [0u8; 128];
        assert!(send_topic::<ReportTopic>(&mut buf, u32::MAX, &report).is_some());
    }
}
