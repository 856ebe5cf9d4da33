//! The modem's built-in GPS receiver

use crate::config::Location;

/// How far along location acquisition is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum GpsStatus {
    /// This node has a statically configured position
    NotConfigured,
    /// No report from the receiver yet
    NoData,
    /// Reports, but without a fix
    NoLocation,
    /// A fix without altitude
    Partial,
    /// A full fix
    Full,
    /// Gave up without a fix
    Aborted,
}

#[derive(Debug, Default)]
pub(crate) struct Gps {
    pub(crate) shutdown: bool,
    pub(crate) send_shutdown_when_idle: bool,
    pub(crate) have_location: bool,
    pub(crate) update_location: bool,
    pub(crate) data_parsed: bool,
    pub(crate) partial: bool,
    pub(crate) location: Option<Location>,
}

impl Gps {
    pub(crate) fn status(&self) -> GpsStatus {
        match (self.have_location, self.location) {
            (true, Some(_)) => GpsStatus::Full,
            // shut down without ever getting a fix
            (true, None) => GpsStatus::Aborted,
            (false, _) if self.partial => GpsStatus::Partial,
            (false, _) if self.data_parsed => GpsStatus::NoLocation,
            (false, _) => GpsStatus::NoData,
        }
    }
}

/// A fix parsed from a `+cgpsinfo:` report
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Fix {
    /// All fields were empty
    None,
    /// Position known, altitude missing
    Partial,
    /// Full position
    Full(Location),
}

/// Parse the fields after `+cgpsinfo:`
///
/// `lat,N|S,lon,E|W,ddmmyy,hhmmss.s,alt,...` with coordinates as
/// `dddmm.mmmm`.
pub(crate) fn parse_info(fields: &str) -> Fix {
    let mut f = fields.trim().split(',').map(str::trim);
    let mut next = || f.next().unwrap_or("");
    let (lat, ns, lon, ew, _date, _time, alt) =
        (next(), next(), next(), next(), next(), next(), next());

    if lat.is_empty() || lon.is_empty() {
        return Fix::None;
    }
    let (Some(lat), Some(lon)) = (to_degrees(lat, ns), to_degrees(lon, ew)) else {
        return Fix::None;
    };
    let Ok(alt) = alt.parse::<f32>() else {
        return Fix::Partial;
    };
    // The receiver reports altitude with the wrong sign
    let alt = if alt < 0.0 { -alt } else { alt };
    Fix::Full(Location { lat, lon, alt })
}

fn to_degrees(value: &str, hemisphere: &str) -> Option<f32> {
    let v: f32 = value.parse().ok()?;
    let deg = (v / 100.0) as i32 as f32;
    let min = v - deg * 100.0;
    let d = deg + min / 60.0;
    match hemisphere {
        "S" | "s" | "W" | "w" => Some(-d),
        _ => Some(d),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_fix() {
        let fix = parse_info("3723.2475,N,12158.3416,W,011018,182143.0,-13.5,0.0,0.0");
        let Fix::Full(loc) = fix else {
            panic!("expected a fix, got {fix:?}");
        };
        assert!((loc.lat - 37.387_46).abs() < 1e-3);
        assert!((loc.lon + 121.972_36).abs() < 1e-3);
        assert_eq!(loc.alt, 13.5);
    }

    #[test]
    fn empty_report_is_no_fix() {
        assert_eq!(parse_info(",,,,,,,,"), Fix::None);
        assert_eq!(parse_info(""), Fix::None);
    }

    #[test]
    fn missing_altitude_is_partial() {
        assert_eq!(
            parse_info("3723.2475,N,12158.3416,W,011018,182143.0,,0.0,0.0"),
            Fix::Partial
        );
    }

    #[test]
    fn status_progression() {
        let mut g = Gps::default();
        assert_eq!(g.status(), GpsStatus::NoData);
        g.data_parsed = true;
        assert_eq!(g.status(), GpsStatus::NoLocation);
        g.partial = true;
        assert_eq!(g.status(), GpsStatus::Partial);
        g.have_location = true;
        assert_eq!(g.status(), GpsStatus::Aborted);
        g.location = Some(Location {
            lat: 1.0,
            lon: 2.0,
            alt: 3.0,
        });
        assert_eq!(g.status(), GpsStatus::Full);
    }
}
