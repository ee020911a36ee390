//! A simulated operator walking a jittered course.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hudlink_core::{PositionFix, PositionSource};

use crate::config::TrackConfig;

/// Meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Seeded RNG; `seed == 0` draws the seed from the OS.
pub fn rng(seed: u64) -> StdRng {
    if seed == 0 {
        StdRng::from_entropy()
    } else {
        StdRng::seed_from_u64(seed)
    }
}

struct State {
    fix: PositionFix,
    rng: StdRng,
}

/// Position source that advances only when [`Track::step`] is called.
pub struct Track {
    speed_mps: f64,
    heading_jitter: f64,
    state: Mutex<State>,
}

impl Track {
    pub fn new(config: &TrackConfig, seed: u64) -> Self {
        let rng = rng(seed);
        Self {
            speed_mps: config.speed_mps,
            heading_jitter: config.heading_jitter.abs(),
            state: Mutex::new(State {
                fix: PositionFix::new(
                    config.lat,
                    config.lon,
                    config.hae,
                    config.heading.rem_euclid(360.0),
                    config.callsign.clone(),
                ),
                rng,
            }),
        }
    }

    /// Move along the current heading for `dt`, then perturb the heading.
    pub fn step(&self, dt: Duration) -> PositionFix {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let State { fix, rng } = &mut *state;

        let distance = self.speed_mps * dt.as_secs_f64();
        let bearing = fix.heading.to_radians();
        fix.lat = (fix.lat + distance * bearing.cos() / METERS_PER_DEGREE).clamp(-90.0, 90.0);
        let meters_per_lon = METERS_PER_DEGREE * fix.lat.to_radians().cos().max(1e-6);
        fix.lon += distance * bearing.sin() / meters_per_lon;
        if fix.lon > 180.0 {
            fix.lon -= 360.0;
        } else if fix.lon < -180.0 {
            fix.lon += 360.0;
        }

        if self.heading_jitter > 0.0 {
            let turn = rng.gen_range(-self.heading_jitter..=self.heading_jitter);
            fix.heading = (fix.heading + turn).rem_euclid(360.0);
        }
        fix.hae += rng.gen_range(-0.2..=0.2);

        fix.clone()
    }

    pub fn current(&self) -> PositionFix {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fix
            .clone()
    }
}

#[async_trait]
impl PositionSource for Track {
    async fn current_position(&self) -> Option<PositionFix> {
        Some(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(heading: f64, jitter: f64) -> TrackConfig {
        TrackConfig {
            heading,
            heading_jitter: jitter,
            speed_mps: 10.0,
            ..TrackConfig::default()
        }
    }

    #[test]
    fn eastbound_track_increases_longitude() {
        let track = Track::new(&config(90.0, 0.0), 7);
        let start = track.current();
        let next = track.step(Duration::from_secs(10));
        assert!(next.lon > start.lon);
        assert!((next.lat - start.lat).abs() < 1e-9);
        assert_eq!(next.heading, 90.0);
    }

    #[test]
    fn same_seed_same_walk() {
        let a = Track::new(&config(0.0, 30.0), 42);
        let b = Track::new(&config(0.0, 30.0), 42);
        for _ in 0..20 {
            let (fa, fb) = (a.step(Duration::from_millis(100)), b.step(Duration::from_millis(100)));
            assert_eq!(fa, fb);
        }
    }

    #[test]
    fn walk_stays_valid() {
        let track = Track::new(&config(359.0, 45.0), 3);
        for _ in 0..500 {
            let fix = track.step(Duration::from_secs(1));
            assert!(fix.is_valid());
            assert!((0.0..360.0).contains(&fix.heading));
        }
    }

    #[tokio::test]
    async fn source_reports_current_fix() {
        let track = Track::new(&TrackConfig::default(), 1);
        let fix = track.current_position().await.unwrap();
        assert_eq!(fix.callsign, "HUDLink-SIM");
    }
}
