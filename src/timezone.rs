/// Coarse coordinate boxes used when the timezone API is unavailable.
/// Entries are checked in order, so narrower regions come before the wider
/// ones they overlap.
const TIMEZONE_BOXES: &[(f64, f64, f64, f64, &str)] = &[
    // (lat_min, lat_max, lng_min, lng_max, zone)
    (18.0, 23.0, -161.0, -154.0, "Pacific/Honolulu"),
    (51.0, 72.0, -170.0, -129.0, "America/Anchorage"),
    (32.0, 49.0, -125.0, -114.0, "America/Los_Angeles"),
    (31.0, 49.0, -114.0, -102.0, "America/Denver"),
    (25.0, 49.0, -102.0, -87.0, "America/Chicago"),
    (24.0, 48.0, -87.0, -66.0, "America/New_York"),
    (14.0, 33.0, -118.0, -86.0, "America/Mexico_City"),
    (-34.0, 5.0, -74.0, -34.0, "America/Sao_Paulo"),
    (36.0, 44.0, -10.0, 3.0, "Europe/Madrid"),
    (49.0, 61.0, -11.0, 2.0, "Europe/London"),
    (42.0, 55.0, 2.0, 16.0, "Europe/Berlin"),
    (34.0, 60.0, 16.0, 30.0, "Europe/Athens"),
    (41.0, 70.0, 30.0, 60.0, "Europe/Moscow"),
    (6.0, 36.0, 68.0, 97.0, "Asia/Kolkata"),
    (24.0, 46.0, 122.0, 146.0, "Asia/Tokyo"),
    (18.0, 54.0, 97.0, 122.0, "Asia/Shanghai"),
    (-36.0, -13.0, 112.0, 129.0, "Australia/Perth"),
    (-44.0, -28.0, 141.0, 154.0, "Australia/Sydney"),
    (-48.0, -34.0, 166.0, 179.0, "Pacific/Auckland"),
];

pub const DEFAULT_TIMEZONE: &str = "UTC";

pub fn fallback_timezone(latitude: f64, longitude: f64) -> &'static str {
    TIMEZONE_BOXES
        .iter()
        .find(|(lat_min, lat_max, lng_min, lng_max, _)| {
            (*lat_min..=*lat_max).contains(&latitude) && (*lng_min..=*lng_max).contains(&longitude)
        })
        .map(|(_, _, _, _, zone)| *zone)
        .unwrap_or(DEFAULT_TIMEZONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_cities() {
        assert_eq!(fallback_timezone(40.7128, -74.006), "America/New_York");
        assert_eq!(fallback_timezone(51.5074, -0.1278), "Europe/London");
        assert_eq!(fallback_timezone(21.3069, -157.8583), "Pacific/Honolulu");
        assert_eq!(fallback_timezone(-33.8688, 151.2093), "Australia/Sydney");
    }

    #[test]
    fn defaults_to_utc_in_open_ocean() {
        assert_eq!(fallback_timezone(0.0, 0.0), DEFAULT_TIMEZONE);
        assert_eq!(fallback_timezone(f64::NAN, 10.0), DEFAULT_TIMEZONE);
    }
}
