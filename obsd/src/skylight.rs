//! Observational duration classifier.
//!
//! One process-wide task computes the Sun's altitude for every configured
//! site every two minutes and derives the coarse sky-brightness class.
//! Transitions fan out to the group's observation systems and drive the
//! dome-slit choreography around daytime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use obs_wire::Odt;

use crate::astro;
use crate::federation::Federation;

/// Sun altitude → duration type. The boundary at `day_min` is inclusive on
/// the lower side: a sun sitting exactly there already counts as FLAT.
pub fn classify(sun_alt: f64, day_min: f64, night_max: f64) -> Odt {
    if sun_alt > day_min {
        Odt::Daytime
    } else if sun_alt < night_max {
        Odt::Night
    } else {
        Odt::Flat
    }
}

pub async fn run(federation: Arc<Federation>) {
    let mut tick = tokio::time::interval(Duration::from_secs(120));
    loop {
        tick.tick().await;
        let now = Utc::now();
        let mjd = astro::mjd(now);
        let groups: Vec<_> = federation
            .cfg
            .observation_system
            .iter()
            .map(|o| (o.group_id.clone(), o.site.lon, o.site.lat, o.sun.day_min, o.sun.night_max))
            .collect();
        for (gid, lon, lat, day_min, night_max) in groups {
            let alt = astro::sun_altitude(mjd, lon, lat);
            let odt = classify(alt, day_min, night_max);
            if federation.apply_odt(&gid, odt).await {
                info!(%gid, "sun at {alt:.1} deg, duration type becomes {odt:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_bands() {
        assert_eq!(classify(10.0, -6.0, -12.0), Odt::Daytime);
        assert_eq!(classify(-5.9, -6.0, -12.0), Odt::Daytime);
        assert_eq!(classify(-8.0, -6.0, -12.0), Odt::Flat);
        assert_eq!(classify(-12.0, -6.0, -12.0), Odt::Flat);
        assert_eq!(classify(-12.1, -6.0, -12.0), Odt::Night);
    }

    #[test]
    fn boundary_at_day_min_is_flat() {
        assert_eq!(classify(-6.0, -6.0, -12.0), Odt::Flat);
    }
}
