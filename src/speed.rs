//! Per-track speed estimation over a sliding window of rectified positions.
//!
//! Each track keeps the vertical reference-space coordinate of its anchor point
//! for the last `window = round(fps)` updates. Speed is the displacement between
//! the oldest and newest sample divided by the time the window spans:
//!
//! `speed = |first - last| / (len / fps) * unit_factor`
//!
//! Until a track has `min_samples = round(fps / 2)` samples its speed is
//! `SpeedEstimate::Insufficient`, which callers must keep distinct from zero.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::detect::TrackedObject;
use crate::transform::ViewTransformer;

/// Meters per second to kilometers per hour.
pub const MPS_TO_KMH: f64 = 3.6;

/// Highest frame rate accepted; the window holds one second of samples.
pub const MAX_FPS: f64 = 1000.0;

/// Histories start small and grow up to the window.
const INITIAL_HISTORY_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SpeedEstimate {
    Insufficient { samples: usize, required: usize },
    Measured { value: f64 },
}

impl SpeedEstimate {
    pub fn value(&self) -> Option<f64> {
        match self {
            SpeedEstimate::Measured { value } => Some(*value),
            SpeedEstimate::Insufficient { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpeedSettings {
    pub fps: f64,
    /// Real-world meters covered by one reference-rectangle unit.
    pub meters_per_unit: f64,
    /// Drop a track after this many updates without seeing it. `None` keeps
    /// histories for the estimator's lifetime.
    pub track_ttl_frames: Option<u64>,
}

#[derive(Debug)]
struct TrackHistory {
    samples: VecDeque<f64>,
    last_seen: u64,
}

pub struct SpeedEstimator {
    transformer: ViewTransformer,
    fps: f64,
    window: usize,
    min_samples: usize,
    unit_factor: f64,
    track_ttl_frames: Option<u64>,
    updates: u64,
    tracks: HashMap<u64, TrackHistory>,
}

impl SpeedSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(anyhow!("fps must be a positive number"));
        }
        if self.fps > MAX_FPS {
            return Err(anyhow!("fps must be at most {}, got {}", MAX_FPS, self.fps));
        }
        if !(self.meters_per_unit.is_finite() && self.meters_per_unit > 0.0) {
            return Err(anyhow!("meters_per_unit must be a positive number"));
        }
        Ok(())
    }
}

impl SpeedEstimator {
    pub fn new(transformer: ViewTransformer, settings: &SpeedSettings) -> Result<Self> {
        settings.validate()?;
        let window = (settings.fps.round_ties_even() as usize).max(1);
        let min_samples = ((settings.fps / 2.0).round_ties_even() as usize).clamp(1, window);
        Ok(Self {
            transformer,
            fps: settings.fps,
            window,
            min_samples,
            unit_factor: settings.meters_per_unit * MPS_TO_KMH,
            track_ttl_frames: settings.track_ttl_frames,
            updates: 0,
            tracks: HashMap::new(),
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    pub fn unit_factor(&self) -> f64 {
        self.unit_factor
    }

    pub fn transformer(&self) -> &ViewTransformer {
        &self.transformer
    }

    /// Append one rectified sample per track, in the order objects are given.
    pub fn update(&mut self, objects: &[TrackedObject]) {
        self.updates += 1;
        let anchors: Vec<[f64; 2]> = objects.iter().map(TrackedObject::anchor).collect();
        let rectified = self.transformer.transform(&anchors);

        let mut seen = HashSet::with_capacity(objects.len());
        for (obj, point) in objects.iter().zip(rectified) {
            if !seen.insert(obj.track_id) {
                log::debug!("track {} reported twice in one frame; keeping first", obj.track_id);
                continue;
            }
            let y = point[1];
            if !y.is_finite() {
                log::warn!("track {} anchor maps outside the reference plane", obj.track_id);
                continue;
            }
            self.record(obj.track_id, y);
        }

        self.sweep();
    }

    /// Append a raw reference-space sample. Used by `update` after rectification.
    pub fn record(&mut self, track_id: u64, y: f64) {
        let window = self.window;
        let history = self.tracks.entry(track_id).or_insert_with(|| TrackHistory {
            samples: VecDeque::with_capacity(window.min(INITIAL_HISTORY_CAPACITY)),
            last_seen: 0,
        });
        while history.samples.len() >= window {
            history.samples.pop_front();
        }
        history.samples.push_back(y);
        history.last_seen = self.updates;
    }

    pub fn speed_of(&self, track_id: u64) -> SpeedEstimate {
        let Some(history) = self.tracks.get(&track_id) else {
            return SpeedEstimate::Insufficient {
                samples: 0,
                required: self.min_samples,
            };
        };
        let len = history.samples.len();
        if len < self.min_samples {
            return SpeedEstimate::Insufficient {
                samples: len,
                required: self.min_samples,
            };
        }
        let (Some(first), Some(last)) = (history.samples.front(), history.samples.back()) else {
            return SpeedEstimate::Insufficient {
                samples: 0,
                required: self.min_samples,
            };
        };
        let distance = (first - last).abs();
        let seconds = len as f64 / self.fps;
        SpeedEstimate::Measured {
            value: distance / seconds * self.unit_factor,
        }
    }

    pub fn history_len(&self, track_id: u64) -> usize {
        self.tracks.get(&track_id).map_or(0, |h| h.samples.len())
    }

    pub fn history(&self, track_id: u64) -> Vec<f64> {
        self.tracks
            .get(&track_id)
            .map(|h| h.samples.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracks.len()
    }

    fn sweep(&mut self) {
        let Some(ttl) = self.track_ttl_frames else {
            return;
        };
        let now = self.updates;
        let before = self.tracks.len();
        self.tracks.retain(|_, h| now - h.last_seen <= ttl);
        let evicted = before - self.tracks.len();
        if evicted > 0 {
            log::debug!("evicted {} stale track histories", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;
    use crate::frame::BoundingBox;
    use crate::transform::reference_rectangle;

    fn identity() -> ViewTransformer {
        let quad = reference_rectangle(100.0, 1000.0);
        ViewTransformer::new(quad, quad).unwrap()
    }

    fn estimator(fps: f64, ttl: Option<u64>) -> SpeedEstimator {
        SpeedEstimator::new(
            identity(),
            &SpeedSettings {
                fps,
                meters_per_unit: 1.0,
                track_ttl_frames: ttl,
            },
        )
        .unwrap()
    }

    fn object_at(track_id: u64, y: f32) -> TrackedObject {
        TrackedObject {
            track_id,
            bbox: BoundingBox::new(40.0, y - 20.0, 60.0, y),
            confidence: 0.9,
            class: ObjectClass::Car,
        }
    }

    #[test]
    fn window_constants_follow_fps() {
        let est = estimator(25.0, None);
        assert_eq!(est.window(), 25);
        assert_eq!(est.min_samples(), 12);

        let est = estimator(30.0, None);
        assert_eq!(est.window(), 30);
        assert_eq!(est.min_samples(), 15);
    }

    #[test]
    fn insufficient_until_half_window() {
        let mut est = estimator(25.0, None);
        for i in 0..11 {
            est.update(&[object_at(1, 10.0 + i as f32)]);
            assert!(est.speed_of(1).value().is_none(), "sample {}", i + 1);
        }
        est.update(&[object_at(1, 30.0)]);
        assert!(est.speed_of(1).value().is_some());
        for i in 0..20 {
            est.update(&[object_at(1, 31.0 + i as f32)]);
            assert!(est.speed_of(1).value().is_some());
        }
    }

    #[test]
    fn unknown_track_is_insufficient_not_zero() {
        let est = estimator(25.0, None);
        assert_eq!(
            est.speed_of(99),
            SpeedEstimate::Insufficient {
                samples: 0,
                required: 12
            }
        );
    }

    #[test]
    fn linear_track_over_one_second() {
        let mut est = estimator(25.0, None);
        for i in 0..25 {
            est.record(1, 100.0 * i as f64 / 24.0);
        }
        let speed = est.speed_of(1).value().unwrap();
        let expected = 100.0 / 1.0 * est.unit_factor();
        assert!((speed - expected).abs() < 1e-9, "{} != {}", speed, expected);
        assert!((speed - 360.0).abs() < 1e-9);
    }

    #[test]
    fn history_is_bounded_and_fifo() {
        let mut est = estimator(10.0, None);
        for i in 0..15 {
            est.record(4, i as f64);
        }
        assert_eq!(est.history_len(4), 10);
        assert_eq!(est.history(4), (5..15).map(|v| v as f64).collect::<Vec<_>>());
    }

    #[test]
    fn one_sample_per_track_per_update() {
        let mut est = estimator(10.0, None);
        est.update(&[object_at(1, 100.0), object_at(1, 200.0), object_at(2, 50.0)]);
        assert_eq!(est.history(1), vec![100.0]);
        assert_eq!(est.history_len(2), 1);
    }

    #[test]
    fn stale_tracks_are_swept() {
        let mut est = estimator(10.0, Some(3));
        est.update(&[object_at(1, 100.0), object_at(2, 100.0)]);
        for _ in 0..3 {
            est.update(&[object_at(2, 110.0)]);
        }
        assert_eq!(est.history_len(1), 1);
        est.update(&[object_at(2, 120.0)]);
        assert_eq!(est.history_len(1), 0);
        assert_eq!(est.tracked_count(), 1);
    }

    #[test]
    fn rejects_non_positive_fps() {
        let settings = SpeedSettings {
            fps: 0.0,
            meters_per_unit: 1.0,
            track_ttl_frames: None,
        };
        assert!(SpeedEstimator::new(identity(), &settings).is_err());
    }

    #[test]
    fn rejects_absurd_fps() {
        for fps in [1e20, MAX_FPS + 1.0, f64::INFINITY] {
            let settings = SpeedSettings {
                fps,
                meters_per_unit: 1.0,
                track_ttl_frames: None,
            };
            assert!(SpeedEstimator::new(identity(), &settings).is_err(), "fps {}", fps);
        }

        let mut est = estimator(MAX_FPS, None);
        assert_eq!(est.window(), 1000);
        est.record(1, 5.0);
        assert_eq!(est.history_len(1), 1);
    }
}
