//! Eye-pair filter and forward predictor.
//!
//! Each eye coordinate runs an independent constant-velocity Kalman filter
//! (state: position in mm, velocity in mm/s) driven by a white-noise
//! acceleration model. Predictions extrapolate the filtered state to
//! `now + latency` and are shaped toward a neutral pose while the user is lost.

use std::f64::consts::PI;
use std::time::Duration;

use crate::config::PredictorConfig;
use crate::types::{EyePair, Point3};

/// Velocity variance of a freshly seeded filter, (mm/s)².
const INITIAL_VELOCITY_VARIANCE: f64 = 1.0e6;

#[derive(Debug, Clone, Copy)]
struct AxisFilter {
    pos: f64,
    vel: f64,
    /// Covariance [[pp, pv], [vp, vv]].
    p: [[f64; 2]; 2],
}

impl AxisFilter {
    fn seed(z: f64, measurement_noise: f64) -> Self {
        Self {
            pos: z,
            vel: 0.0,
            p: [[measurement_noise, 0.0], [0.0, INITIAL_VELOCITY_VARIANCE]],
        }
    }

    fn update(&mut self, z: f64, dt: f64, q: f64, r: f64) {
        // Predict.
        let pos = self.pos + self.vel * dt;
        let [[p00, p01], [p10, p11]] = self.p;
        let dt2 = dt * dt;
        let p00 = p00 + dt * (p01 + p10) + dt2 * p11 + q * dt2 * dt2 / 4.0;
        let p01 = p01 + dt * p11 + q * dt2 * dt / 2.0;
        let p10 = p10 + dt * p11 + q * dt2 * dt / 2.0;
        let p11 = p11 + q * dt2;

        // Correct.
        let s = p00 + r;
        let k0 = p00 / s;
        let k1 = p10 / s;
        let innovation = z - pos;
        self.pos = pos + k0 * innovation;
        self.vel += k1 * innovation;
        self.p = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
    }

    fn extrapolate(&self, horizon_s: f64) -> f64 {
        self.pos + self.vel * horizon_s
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    left: [AxisFilter; 3],
    right: [AxisFilter; 3],
    /// Time of the last valid sample, µs.
    last_time: u64,
}

impl Track {
    fn seed(sample: &EyePair, r: f64) -> Self {
        Self {
            left: seed_point(&sample.left, r),
            right: seed_point(&sample.right, r),
            last_time: sample.time,
        }
    }
}

fn seed_point(p: &Point3, r: f64) -> [AxisFilter; 3] {
    [
        AxisFilter::seed(p.x, r),
        AxisFilter::seed(p.y, r),
        AxisFilter::seed(p.z, r),
    ]
}

fn update_point(filters: &mut [AxisFilter; 3], p: &Point3, dt: f64, q: f64, r: f64) {
    filters[0].update(p.x, dt, q, r);
    filters[1].update(p.y, dt, q, r);
    filters[2].update(p.z, dt, q, r);
}

fn extrapolate_point(filters: &[AxisFilter; 3], horizon_s: f64) -> Point3 {
    Point3::new(
        filters[0].extrapolate(horizon_s),
        filters[1].extrapolate(horizon_s),
        filters[2].extrapolate(horizon_s),
    )
}

/// Unblend in progress after the user was reacquired.
#[derive(Debug, Clone, Copy)]
struct Recovery {
    since: u64,
    from_weight: f64,
    duration_us: u64,
}

/// Cosine ease from 0 to 1 over `u` in [0, 1].
fn ease(u: f64) -> f64 {
    (1.0 - (PI * u.clamp(0.0, 1.0)).cos()) / 2.0
}

/// A sample the filter can use: finite coordinates in front of the display.
pub fn is_valid_sample(sample: &EyePair) -> bool {
    sample.left.is_finite() && sample.right.is_finite() && sample.left.z > 0.0 && sample.right.z > 0.0
}

/// Deterministic eye-pair predictor. Time is always passed in, in µs since the
/// Unix epoch, on the same clock that stamps the samples.
#[derive(Debug, Clone)]
pub struct EyePairPredictor {
    config: PredictorConfig,
    face_lost_delay_us: u64,
    track: Option<Track>,
    recovery: Option<Recovery>,
}

impl EyePairPredictor {
    pub fn new(config: PredictorConfig, face_lost_delay: Duration) -> Self {
        Self {
            config,
            face_lost_delay_us: face_lost_delay.as_micros() as u64,
            track: None,
            recovery: None,
        }
    }

    pub fn set_face_lost_delay(&mut self, delay: Duration) {
        self.face_lost_delay_us = delay.as_micros() as u64;
    }

    pub fn face_lost_delay(&self) -> Duration {
        Duration::from_micros(self.face_lost_delay_us)
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        self.track = None;
        self.recovery = None;
    }

    /// Feed one raw sample. Returns `false` for invalid or out-of-order samples,
    /// which leave the filter untouched.
    pub fn ingest(&mut self, sample: &EyePair) -> bool {
        if !is_valid_sample(sample) {
            log::trace!("Ignoring invalid eye sample {}", sample.frame_id);
            return false;
        }
        let r = self.config.measurement_noise;
        let q = self.config.acceleration_noise;

        let last_time = match self.track.as_ref() {
            None => {
                // Nothing was tracked, so output sat at the neutral pose.
                self.track = Some(Track::seed(sample, r));
                self.recovery = Some(self.recovery_from(sample, 1.0));
                return true;
            }
            Some(track) => track.last_time,
        };

        if sample.time <= last_time {
            log::trace!(
                "Ignoring stale eye sample {} ({} <= {})",
                sample.frame_id,
                sample.time,
                last_time
            );
            return false;
        }

        let gap = sample.time - last_time;
        if gap > self.face_lost_delay_us {
            let from_weight = self.blend_weight(sample.time);
            log::debug!(
                "User reacquired after {} ms, unblending from {:.3}",
                gap / 1000,
                from_weight
            );
            self.track = Some(Track::seed(sample, r));
            self.recovery = Some(self.recovery_from(sample, from_weight));
            return true;
        }

        if let Some(track) = self.track.as_mut() {
            let dt = gap as f64 / 1e6;
            update_point(&mut track.left, &sample.left, dt, q, r);
            update_point(&mut track.right, &sample.right, dt, q, r);
            track.last_time = sample.time;
        }
        true
    }

    fn recovery_from(&self, sample: &EyePair, from_weight: f64) -> Recovery {
        let ws = &self.config.workspace;
        let distance = self.distance_to_neutral(ws.clamp(sample.left), ws.clamp(sample.right));
        Recovery {
            since: sample.time,
            from_weight,
            duration_us: self.ease_duration_us(from_weight * distance),
        }
    }

    fn distance_to_neutral(&self, left: Point3, right: Point3) -> f64 {
        let neutral = self.config.neutral_pose;
        left.distance(&neutral).max(right.distance(&neutral))
    }

    /// Length of a blend that moves the output `distance` mm: half the
    /// face-lost delay, stretched so that no frame at `blend_rate_hz` moves
    /// further than `max_blend_step`. The ease is steepest at π/2 per duration.
    fn ease_duration_us(&self, distance: f64) -> u64 {
        let half = self.face_lost_delay_us / 2;
        let c = &self.config;
        if c.max_blend_step <= 0.0 || c.blend_rate_hz <= 0.0 || !distance.is_finite() {
            return half;
        }
        let stretch_s = PI * distance / (2.0 * c.max_blend_step * c.blend_rate_hz);
        half.max((stretch_s * 1e6).ceil() as u64)
    }

    /// Blend length toward neutral, measured from the track held at the
    /// horizon it reaches when the face-lost delay runs out.
    fn collapse_duration_us(&self, track: &Track) -> u64 {
        let max_horizon = self.config.max_horizon.as_micros() as u64;
        let horizon_s = self.face_lost_delay_us.min(max_horizon) as f64 / 1e6;
        let ws = &self.config.workspace;
        let left = ws.clamp(extrapolate_point(&track.left, horizon_s));
        let right = ws.clamp(extrapolate_point(&track.right, horizon_s));
        self.ease_duration_us(self.distance_to_neutral(left, right))
    }

    /// Weight of the neutral pose in the output at `now_us`: 0 while tracking,
    /// 1 once fully collapsed to mono.
    pub fn blend_weight(&self, now_us: u64) -> f64 {
        let track = match self.track.as_ref() {
            Some(t) => t,
            None => return 1.0,
        };
        let delay = self.face_lost_delay_us;

        let elapsed = now_us.saturating_sub(track.last_time);
        if elapsed > delay {
            let duration = self.collapse_duration_us(track);
            if duration == 0 {
                return 1.0;
            }
            return ease((elapsed - delay) as f64 / duration as f64);
        }

        match self.recovery {
            Some(rec) if rec.duration_us > 0 => {
                let u = now_us.saturating_sub(rec.since) as f64 / rec.duration_us as f64;
                rec.from_weight * (1.0 - ease(u))
            }
            _ => 0.0,
        }
    }

    /// True while samples arrive within the face-lost delay.
    pub fn is_tracking(&self, now_us: u64) -> bool {
        self.track
            .as_ref()
            .map(|t| now_us.saturating_sub(t.last_time) <= self.face_lost_delay_us)
            .unwrap_or(false)
    }

    /// Eye positions (left, right) in mm expected at `now_us + latency_us`.
    pub fn predict(&self, now_us: u64, latency_us: u64) -> (Point3, Point3) {
        let neutral = self.config.neutral_pose;
        let track = match self.track.as_ref() {
            Some(t) => t,
            None => return (neutral, neutral),
        };

        let weight = self.blend_weight(now_us);
        if weight >= 1.0 {
            return (neutral, neutral);
        }

        let target = now_us.saturating_add(latency_us);
        let max_horizon = self.config.max_horizon.as_micros() as u64;
        let horizon_us = target.saturating_sub(track.last_time).min(max_horizon);
        let horizon_s = horizon_us as f64 / 1e6;

        let ws = &self.config.workspace;
        let left = ws.clamp(extrapolate_point(&track.left, horizon_s));
        let right = ws.clamp(extrapolate_point(&track.right, horizon_s));

        if weight <= 0.0 {
            (left, right)
        } else {
            (left.lerp(&neutral, weight), right.lerp(&neutral, weight))
        }
    }

    /// [`predict`](Self::predict) packaged as a frame stamped `now + latency`.
    pub fn predict_pair(&self, now_us: u64, latency_us: u64, frame_id: u64) -> EyePair {
        let (left, right) = self.predict(now_us, latency_us);
        EyePair {
            frame_id,
            time: now_us.saturating_add(latency_us),
            left,
            right,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000_000;
    const STEP: u64 = 10_000;
    const NEUTRAL: Point3 = Point3::new(0.0, 100.0, 600.0);

    fn predictor(delay_ms: u64) -> EyePairPredictor {
        EyePairPredictor::new(PredictorConfig::default(), Duration::from_millis(delay_ms))
    }

    fn sample(id: u64, time: u64, left: Point3, right: Point3) -> EyePair {
        EyePair {
            frame_id: id,
            time,
            left,
            right,
        }
    }

    fn feed_still(p: &mut EyePairPredictor, start: u64, count: u64, left: Point3, right: Point3) -> u64 {
        let mut t = start;
        for k in 0..count {
            t = start + k * STEP;
            assert!(p.ingest(&sample(k, t, left, right)));
        }
        t
    }

    #[test]
    fn test_no_samples_is_neutral() {
        let p = predictor(500);
        let (l, r) = p.predict(T0, 0);
        assert_eq!(l, NEUTRAL);
        assert_eq!(l, r);
    }

    #[test]
    fn test_constant_velocity_extrapolation() {
        let mut p = predictor(500);
        let mut last = 0;
        // A second of ramp so the startup unblend is over.
        for k in 0..=100u64 {
            last = T0 + k * STEP;
            let dx = k as f64; // 1 mm per 10 ms = 100 mm/s
            p.ingest(&sample(
                k,
                last,
                Point3::new(-30.0 + dx, 0.0, 600.0),
                Point3::new(30.0 + dx, 0.0, 600.0),
            ));
        }
        let out = p.predict_pair(last, 80_000, 0);
        assert_eq!(out.time, last + 80_000);
        // 80 ms ahead at 100 mm/s is 8 mm past the last sample (x = 70 / 130).
        assert!((out.left.x - 78.0).abs() < 1.0, "left.x = {}", out.left.x);
        assert!((out.right.x - 138.0).abs() < 1.0, "right.x = {}", out.right.x);
        assert!((out.left.z - 600.0).abs() < 1e-6);
    }

    #[test]
    fn test_user_lost_collapses_to_mono() {
        let mut p = predictor(500);
        let last = feed_still(
            &mut p,
            T0,
            100,
            Point3::new(-32.0, 0.0, 600.0),
            Point3::new(32.0, 0.0, 600.0),
        );
        assert!(p.blend_weight(last) < 1e-12);
        // Still within the delay: the estimate holds.
        let (l, _) = p.predict(last + 400_000, 0);
        assert!((l.x + 32.0).abs() < 1e-6);
        // 105 mm from neutral needs about 690 ms at 2 mm per 120 Hz frame.
        let (l, _) = p.predict(last + 800_000, 0);
        assert!(l.distance(&NEUTRAL) > 1.0);
        let (l, r) = p.predict(last + 1_300_000, 0);
        assert!(l.distance(&NEUTRAL) < 1e-9);
        assert_eq!(l, r);
        assert!(!p.is_tracking(last + 1_300_000));
    }

    #[test]
    fn test_reacquire_unblends_within_half_delay() {
        let mut p = predictor(500);
        let lost_at = feed_still(
            &mut p,
            T0,
            100,
            Point3::new(-32.0, 0.0, 600.0),
            Point3::new(32.0, 0.0, 600.0),
        );
        let back = lost_at + 1_300_000;
        // Close enough to neutral that the unblend fits in half the delay.
        let left = Point3::new(-31.0, 95.0, 610.0);
        let right = Point3::new(31.0, 95.0, 610.0);

        assert!(p.ingest(&sample(100, back, left, right)));
        // Right at reacquisition the output still sits at neutral.
        let (l, _) = p.predict(back, 0);
        assert!(l.distance(&NEUTRAL) < 1e-6);

        let last = feed_still(&mut p, back + STEP, 30, left, right);
        assert!(last - back >= 250_000);
        let (l, r) = p.predict(last, 0);
        assert!(l.distance(&left) < 2.0);
        assert!(r.distance(&right) < 2.0);
    }

    /// Largest per-eye move between consecutive 120 Hz predictions in
    /// `(from, to]`, feeding `still` samples every `STEP` when given.
    fn max_step_at_120hz(
        p: &mut EyePairPredictor,
        from: u64,
        to: u64,
        still: Option<(Point3, Point3)>,
    ) -> f64 {
        let frame_us = 1_000_000 / 120;
        let mut next_sample = from + STEP;
        let mut id = 1_000;
        let (mut prev_l, mut prev_r) = p.predict(from, 0);
        let mut worst: f64 = 0.0;
        let mut now = from;
        while now < to {
            now += frame_us;
            if let Some((left, right)) = still {
                while next_sample <= now {
                    assert!(p.ingest(&sample(id, next_sample, left, right)));
                    next_sample += STEP;
                    id += 1;
                }
            }
            let (l, r) = p.predict(now, 0);
            worst = worst.max(l.distance(&prev_l)).max(r.distance(&prev_r));
            prev_l = l;
            prev_r = r;
        }
        worst
    }

    #[test]
    fn test_collapse_is_smooth_at_default_delay() {
        let mut p = predictor(500);
        let last = feed_still(
            &mut p,
            T0,
            100,
            Point3::new(-32.0, 0.0, 600.0),
            Point3::new(32.0, 0.0, 600.0),
        );
        let worst = max_step_at_120hz(&mut p, last, last + 2_000_000, None);
        assert!(worst <= 2.0 + 1e-9, "largest step {} mm", worst);
        let (l, r) = p.predict(last + 2_000_000, 0);
        assert!(l.distance(&NEUTRAL) < 1e-9);
        assert_eq!(l, r);
    }

    #[test]
    fn test_far_reacquire_unblends_smoothly() {
        let mut p = predictor(500);
        let lost_at = feed_still(
            &mut p,
            T0,
            100,
            Point3::new(-32.0, 0.0, 600.0),
            Point3::new(32.0, 0.0, 600.0),
        );
        let back = lost_at + 1_300_000;
        let left = Point3::new(-20.0, 10.0, 650.0);
        let right = Point3::new(44.0, 10.0, 650.0);
        assert!(p.ingest(&sample(100, back, left, right)));

        // 112 mm to cover stretches the unblend past half the delay.
        let worst = max_step_at_120hz(&mut p, back, back + 1_000_000, Some((left, right)));
        assert!(worst <= 2.0 + 1e-9, "largest step {} mm", worst);
        let (l, r) = p.predict(back + 1_000_000, 0);
        assert!(l.distance(&left) < 1e-9);
        assert!(r.distance(&right) < 1e-9);
    }

    #[test]
    fn test_zero_blend_step_runs_over_half_delay() {
        let config = PredictorConfig {
            max_blend_step: 0.0,
            ..PredictorConfig::default()
        };
        let mut p = EyePairPredictor::new(config, Duration::from_millis(500));
        let last = feed_still(
            &mut p,
            T0,
            100,
            Point3::new(-32.0, 0.0, 600.0),
            Point3::new(32.0, 0.0, 600.0),
        );
        assert!(p.blend_weight(last + 625_000) > 0.4);
        assert!(p.blend_weight(last + 625_000) < 0.6);
        assert_eq!(p.blend_weight(last + 750_000), 1.0);
    }

    #[test]
    fn test_saccade_overshoot_and_lag() {
        let mut p = predictor(500);
        // At rest for a second, then 150 mm/s along x for 200 ms, then at rest.
        let truth = |k: u64| -> f64 {
            match k {
                0..=99 => 0.0,
                100..=119 => 1.5 * (k - 100) as f64,
                _ => 30.0,
            }
        };
        let mut worst_lag_ms: f64 = 0.0;
        let mut overshoot: f64 = 0.0;
        for k in 0..300u64 {
            let x = truth(k);
            let t = T0 + k * STEP;
            assert!(p.ingest(&sample(
                k,
                t,
                Point3::new(-32.0 + x, 0.0, 600.0),
                Point3::new(32.0 + x, 0.0, 600.0),
            )));
            let (l, _) = p.predict(t, 0);
            let filtered = l.x + 32.0;
            if (105..120).contains(&k) {
                worst_lag_ms = worst_lag_ms.max((x - filtered) / 150.0 * 1000.0);
            }
            if k >= 120 {
                overshoot = overshoot.max(filtered - 30.0);
            }
        }
        assert!(worst_lag_ms <= 20.0, "lag {} ms", worst_lag_ms);
        assert!(overshoot <= 5.0, "overshoot {} mm", overshoot);
        let (l, _) = p.predict(T0 + 299 * STEP, 0);
        assert!((l.x + 2.0).abs() < 0.5, "settled at {}", l.x);
    }

    #[test]
    fn test_blend_is_smooth_at_120hz() {
        let mut p = predictor(2000);
        let last = feed_still(
            &mut p,
            T0,
            101,
            Point3::new(-32.0, 0.0, 600.0),
            Point3::new(32.0, 0.0, 600.0),
        );
        let frame_us = 1_000_000 / 120;
        let (mut prev_l, mut prev_r) = p.predict(last, 0);
        let mut now = last;
        while now < last + 3_500_000 {
            now += frame_us;
            let (l, r) = p.predict(now, 0);
            assert!(l.distance(&prev_l) <= 2.0, "step {} at {}", l.distance(&prev_l), now - last);
            assert!(r.distance(&prev_r) <= 2.0);
            prev_l = l;
            prev_r = r;
        }
        assert!(prev_l.distance(&NEUTRAL) < 1e-9);
    }

    #[test]
    fn test_predictions_are_deterministic() {
        let trace: Vec<EyePair> = (0..60u64)
            .map(|k| {
                let jitter = if k % 3 == 0 { 0.4 } else { -0.2 };
                sample(
                    k,
                    T0 + k * STEP + (k % 4) * 1_500,
                    Point3::new(-31.0 + 0.3 * k as f64 + jitter, 2.0, 610.0 - jitter),
                    Point3::new(33.0 + 0.3 * k as f64, 2.0 + jitter, 612.0),
                )
            })
            .collect();

        let mut a = predictor(500);
        let mut b = predictor(500);
        for s in &trace {
            a.ingest(s);
            b.ingest(s);
        }
        let now = trace[59].time + 3_000;
        for latency in [0u64, 16_000, 40_000, 80_000] {
            let pa = a.predict(now, latency);
            let pb = b.predict(now, latency);
            assert_eq!(pa.0.x.to_bits(), pb.0.x.to_bits());
            assert_eq!(pa.1.z.to_bits(), pb.1.z.to_bits());
            assert_eq!(pa, a.predict(now, latency));
        }
    }

    #[test]
    fn test_invalid_and_stale_samples_ignored() {
        let mut p = predictor(500);
        let left = Point3::new(-30.0, 0.0, 600.0);
        let right = Point3::new(30.0, 0.0, 600.0);
        assert!(p.ingest(&sample(1, T0, left, right)));
        assert!(!p.ingest(&sample(2, T0, left, right)));
        assert!(!p.ingest(&sample(3, T0 - 5, left, right)));
        assert!(!p.ingest(&sample(4, T0 + STEP, Point3::default(), Point3::default())));
        assert!(!p.ingest(&sample(
            5,
            T0 + STEP,
            Point3::new(f64::NAN, 0.0, 600.0),
            right
        )));
    }

    #[test]
    fn test_output_clamped_to_workspace() {
        let mut p = predictor(500);
        let left = Point3::new(-390.0, 0.0, 320.0);
        let right = Point3::new(-330.0, 0.0, 320.0);
        feed_still(&mut p, T0, 2, left, right);
        // Fast motion toward the edge of the workspace.
        for k in 2..20u64 {
            let dx = 20.0 * (k - 1) as f64;
            p.ingest(&sample(
                k,
                T0 + k * STEP,
                Point3::new(-390.0 - dx, 0.0, 320.0 - dx),
                Point3::new(-330.0 - dx, 0.0, 320.0 - dx),
            ));
        }
        let (l, r) = p.predict(T0 + 19 * STEP, 100_000);
        assert!(l.x >= -400.0 && r.x >= -400.0);
        assert!(l.z >= 300.0 && r.z >= 300.0);
    }

    #[test]
    fn test_reset_and_delay_setter() {
        let mut p = predictor(500);
        feed_still(
            &mut p,
            T0,
            3,
            Point3::new(-30.0, 0.0, 600.0),
            Point3::new(30.0, 0.0, 600.0),
        );
        p.set_face_lost_delay(Duration::from_millis(0));
        assert_eq!(p.face_lost_delay(), Duration::ZERO);
        // No delay, but the collapse is still limited per frame.
        assert!(p.blend_weight(T0 + 2 * STEP + 1) < 1.0);
        assert_eq!(p.blend_weight(T0 + 2 * STEP + 1_000_000), 1.0);
        p.reset();
        assert_eq!(p.blend_weight(T0), 1.0);
    }
}
