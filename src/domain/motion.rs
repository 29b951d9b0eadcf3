//! Motion tracker.
//!
//! Folds raw accelerometer samples into the running empirical maximum that
//! normalizes the control axes. The range the platform reports for its
//! sensor is not trustworthy, so the ceiling is discovered from the data
//! itself and only ever grows within a session.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::domain::fanout::Listeners;
use crate::domain::models::MotionSample;

/// Starting ceiling for axis normalization. The divisor never drops below
/// this, which keeps the normalization division defined.
pub const DEFAULT_MAX_MAGNITUDE: f32 = 1.0;

/// Receives each accepted sample together with the current ceiling.
pub trait MotionListener {
    fn on_motion(&mut self, x: f32, y: f32, z: f32, max_magnitude: f32);
}

pub struct MotionTracker {
    x: f32,
    y: f32,
    z: f32,
    max_magnitude: f32,
    listeners: Listeners<dyn MotionListener>,
}

impl MotionTracker {
    pub fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            max_magnitude: DEFAULT_MAX_MAGNITUDE,
            listeners: Listeners::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Rc<RefCell<dyn MotionListener>>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&mut self, listener: &Rc<RefCell<dyn MotionListener>>) {
        self.listeners.remove(listener);
    }

    pub fn max_magnitude(&self) -> f32 {
        self.max_magnitude
    }

    /// Accept one raw sample: grow the ceiling, then fan the sample out.
    /// Non-finite samples are dropped whole; letting a NaN into the ceiling
    /// would poison every later normalization.
    pub fn submit_sample(&mut self, sample: MotionSample) {
        if !(sample.x.is_finite() && sample.y.is_finite() && sample.z.is_finite()) {
            warn!("dropping non-finite motion sample: {:?}", sample);
            return;
        }

        self.x = sample.x;
        self.y = sample.y;
        self.z = sample.z;

        self.max_magnitude = self
            .max_magnitude
            .max(sample.x.abs())
            .max(sample.y.abs())
            .max(sample.z.abs());

        let (x, y, z, max_magnitude) = (self.x, self.y, self.z, self.max_magnitude);
        self.listeners.notify(|l| l.on_motion(x, y, z, max_magnitude));
    }

    /// Restore the default ceiling; used when a session restarts.
    pub fn reset_max(&mut self) {
        self.max_magnitude = DEFAULT_MAX_MAGNITUDE;
    }
}

impl Default for MotionTracker {
    fn default() -> Self {
        Self::new()
    }
}
