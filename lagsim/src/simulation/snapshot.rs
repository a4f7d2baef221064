//! Published simulation state.
//!
//! A [`Snapshot`] is what readers see: the pose pair from the last completed
//! tick (`q` after it, `last_q` before it), the tick counter and the solver
//! diagnostics gathered so far. The producer builds a fresh snapshot after
//! every tick and swaps it in whole, so a reader never sees half a tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::solver::Degeneracy;
use super::states::{BodyTransform, ObjectHandle, Pose};

/// Counters and flags describing solver health
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub ticks: u64, // completed ticks
    pub steps: u64, // completed RK4 steps
    pub evaluations: u64, // force evaluations (4 per step)
    pub degenerate_solves: u64, // solves that needed regularisation or fallback
    pub skipped_solves: u64, // solves whose multipliers were zeroed
    pub last_degeneracy: Option<Degeneracy>,
    pub max_residual: f64, // |C|∞ at the published state
    pub diverged: Option<String>, // reason of the last rolled-back tick
}

impl Diagnostics {
    pub fn is_diverged(&self) -> bool {
        self.diverged.is_some()
    }
}

/// Immutable view of the state after one tick
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub handles: Vec<ObjectHandle>,
    pub q: Vec<Pose>, // after the last tick
    pub last_q: Vec<Pose>, // before the last tick
    pub tick: u64,
    pub time: f64, // simulated seconds
    pub published_at: Instant,
    pub frozen_at: Option<Instant>, // set while the producer is parked
    pub diagnostics: Diagnostics,
}

impl Snapshot {
    /// Blend weight for a smooth query: elapsed time since publication over
    /// the tick period, clamped to [0, 1]. Elapsed time stops while frozen.
    pub fn blend_weight(&self, now: Instant, period: Duration) -> f64 {
        if period.is_zero() {
            return 1.0;
        }
        let end = self.frozen_at.unwrap_or(now);
        let elapsed = end.saturating_duration_since(self.published_at);
        (elapsed.as_secs_f64() / period.as_secs_f64()).clamp(0.0, 1.0)
    }

    /// Transforms for every body.
    ///
    /// Without `smooth` this is exactly `q`. With it, each pose is
    /// `q + weight * (last_q - q)`: position lerp, orientation slerp.
    pub fn positions(&self, smooth: bool, weight: f64) -> Vec<BodyTransform> {
        self.handles
            .iter()
            .zip(self.q.iter().zip(&self.last_q))
            .map(|(handle, (q, last))| BodyTransform {
                handle: *handle,
                pose: if smooth { blend(q, last, weight) } else { *q },
            })
            .collect()
    }

    /// Push every transform into `sink`
    pub fn sync<S: TransformSink + ?Sized>(&self, smooth: bool, weight: f64, sink: &mut S) {
        for transform in self.positions(smooth, weight) {
            sink.apply_transform(&transform);
        }
    }
}

fn blend(q: &Pose, last: &Pose, weight: f64) -> Pose {
    if weight <= 0.0 {
        *q
    } else if weight >= 1.0 {
        *last
    } else {
        q.interpolate(last, weight)
    }
}

/// Receiver of body transforms (the scene layer)
pub trait TransformSink {
    fn apply_transform(&mut self, transform: &BodyTransform);
}

impl TransformSink for HashMap<ObjectHandle, Pose> {
    fn apply_transform(&mut self, transform: &BodyTransform) {
        self.insert(transform.handle, transform.pose);
    }
}

impl TransformSink for Vec<BodyTransform> {
    fn apply_transform(&mut self, transform: &BodyTransform) {
        self.push(*transform);
    }
}
