//! Time-space kernel: sidereal time, coordinate transforms, solar position.
//!
//! All public angles are degrees; azimuth is measured from north through
//! east. Solar coordinates use the low-precision ecliptic formula, good to
//! ~0.01°, which is ample for twilight classification and the flat-field
//! pointing scatter.

use chrono::{DateTime, Utc};

/// Modified Julian Date of a UTC instant.
pub fn mjd(t: DateTime<Utc>) -> f64 {
    // JD = unix / 86400 + 2440587.5; MJD = JD - 2400000.5
    t.timestamp_millis() as f64 / 86_400_000.0 + 40587.0
}

/// Wrap an angle into `[0, 360)`.
pub fn norm_deg(mut a: f64) -> f64 {
    a %= 360.0;
    if a < 0.0 {
        a += 360.0;
    }
    a
}

/// Wrap an angle difference into `[-180, 180)`.
pub fn diff_deg(a: f64) -> f64 {
    let mut d = norm_deg(a);
    if d >= 180.0 {
        d -= 360.0;
    }
    d
}

/// Greenwich mean sidereal time, degrees.
pub fn gmst(mjd: f64) -> f64 {
    let d = mjd - 51544.5; // days since J2000.0
    norm_deg(280.460_618_37 + 360.985_647_366_29 * d)
}

/// Local mean sidereal time, degrees; `lon` east-positive degrees.
pub fn local_mean_sidereal_time(mjd: f64, lon: f64) -> f64 {
    norm_deg(gmst(mjd) + lon)
}

/// Hour angle + declination → azimuth (north-zero) + altitude, all degrees,
/// for a site at latitude `lat`.
pub fn eq_to_horizon(ha: f64, dec: f64, lat: f64) -> (f64, f64) {
    let (h, d, phi) = (ha.to_radians(), dec.to_radians(), lat.to_radians());
    let sin_alt = phi.sin() * d.sin() + phi.cos() * d.cos() * h.cos();
    let alt = sin_alt.asin();
    let azi = (-h.sin() * d.cos()).atan2(d.sin() * phi.cos() - d.cos() * phi.sin() * h.cos());
    (norm_deg(azi.to_degrees()), alt.to_degrees())
}

/// Azimuth (north-zero) + altitude → hour angle + declination, all degrees.
pub fn horizon_to_eq(azi: f64, alt: f64, lat: f64) -> (f64, f64) {
    let (a, e, phi) = (azi.to_radians(), alt.to_radians(), lat.to_radians());
    let sin_dec = e.sin() * phi.sin() + e.cos() * phi.cos() * a.cos();
    let dec = sin_dec.asin();
    let ha = (-a.sin() * e.cos()).atan2(e.sin() * phi.cos() - e.cos() * phi.sin() * a.cos());
    (diff_deg(ha.to_degrees()), dec.to_degrees())
}

/// Apparent solar RA/Dec, degrees, at the given MJD.
pub fn sun_position(mjd: f64) -> (f64, f64) {
    let n = mjd - 51544.5;
    let l = norm_deg(280.460 + 0.985_647_4 * n); // mean longitude
    let g = norm_deg(357.528 + 0.985_600_3 * n).to_radians(); // mean anomaly
    let lambda = (l + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()).to_radians();
    let eps = (23.439 - 0.000_000_4 * n).to_radians();
    let ra = (eps.cos() * lambda.sin()).atan2(lambda.cos());
    let dec = (eps.sin() * lambda.sin()).asin();
    (norm_deg(ra.to_degrees()), dec.to_degrees())
}

/// Solar altitude at the site, degrees.
pub fn sun_altitude(mjd: f64, lon: f64, lat: f64) -> f64 {
    let (ra, dec) = sun_position(mjd);
    let lmst = local_mean_sidereal_time(mjd, lon);
    let (_, alt) = eq_to_horizon(lmst - ra, dec, lat);
    alt
}

/// Great-circle separation of two equatorial positions, degrees.
pub fn sphere_distance(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (r1, d1) = (ra1.to_radians(), dec1.to_radians());
    let (r2, d2) = (ra2.to_radians(), dec2.to_radians());
    let sdr = ((r2 - r1) / 2.0).sin();
    let sdd = ((d2 - d1) / 2.0).sin();
    let a = sdd * sdd + d1.cos() * d2.cos() * sdr * sdr;
    (2.0 * a.sqrt().atan2((1.0 - a).sqrt())).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mjd_of_epochs() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((mjd(t) - 51544.5).abs() < 1e-9);
        let t = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert!((mjd(t) - 40587.0).abs() < 1e-9);
    }

    #[test]
    fn gmst_at_j2000() {
        // GMST at J2000.0 is ~280.46°
        assert!((gmst(51544.5) - 280.460_618_37).abs() < 1e-6);
    }

    #[test]
    fn zenith_round_trip() {
        // An object at ha=0, dec=lat culminates at the zenith.
        let (_, alt) = eq_to_horizon(0.0, 40.0, 40.0);
        assert!((alt - 90.0).abs() < 1e-9);
        // Transform round trip away from the zenith.
        let (azi, alt) = eq_to_horizon(30.0, 20.0, 40.0);
        let (ha, dec) = horizon_to_eq(azi, alt, 40.0);
        assert!((ha - 30.0).abs() < 1e-9, "ha={ha}");
        assert!((dec - 20.0).abs() < 1e-9, "dec={dec}");
    }

    #[test]
    fn eastern_object_has_eastern_azimuth() {
        // Negative hour angle: object east of the meridian.
        let (azi, _) = eq_to_horizon(-40.0, 10.0, 40.0);
        assert!(azi > 0.0 && azi < 180.0, "azi={azi}");
        let (azi, _) = eq_to_horizon(40.0, 10.0, 40.0);
        assert!(azi > 180.0 && azi < 360.0, "azi={azi}");
    }

    #[test]
    fn sun_near_equinox() {
        // 2026 March equinox (Mar 20): solar declination close to zero.
        let t = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let (_, dec) = sun_position(mjd(t));
        assert!(dec.abs() < 1.0, "dec={dec}");
        // Mid-June: declination near +23.4°
        let t = Utc.with_ymd_and_hms(2026, 6, 21, 12, 0, 0).unwrap();
        let (_, dec) = sun_position(mjd(t));
        assert!((dec - 23.4).abs() < 0.5, "dec={dec}");
    }

    #[test]
    fn sun_below_horizon_at_night() {
        // Local midnight in mid-northern latitudes, the Sun is well down.
        let t = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        let alt = sun_altitude(mjd(t), 0.0, 40.0);
        assert!(alt < -30.0, "alt={alt}");
    }

    #[test]
    fn sphere_distance_basics() {
        assert!(sphere_distance(10.0, 20.0, 10.0, 20.0).abs() < 1e-12);
        assert!((sphere_distance(0.0, 0.0, 90.0, 0.0) - 90.0).abs() < 1e-9);
        // Small offset in RA at high declination shrinks by cos(dec).
        let d = sphere_distance(10.0, 60.0, 11.0, 60.0);
        assert!((d - 0.5).abs() < 0.01, "d={d}");
    }
}
