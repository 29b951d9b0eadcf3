//! Control model.
//!
//! Owns the four command axes. Pitch, roll, and yaw are recomputed wholesale
//! from every motion sample; throttle only moves in discrete steps from user
//! input. Every accepted change is fanned out to the registered listeners.

use std::cell::RefCell;
use std::rc::Rc;

use crate::domain::fanout::Listeners;
use crate::domain::motion::MotionListener;

pub const MIN_THROTTLE: u8 = 0;
pub const MAX_THROTTLE: u8 = 255;
pub const MIN_AXIS: i32 = -128;
pub const MAX_AXIS: i32 = 127;

pub const PITCH_SCALER: f32 = 2.0;
pub const YAW_SCALER: f32 = 2.0;
/// Roll is proportional to yaw but is not applied below this pitch.
pub const ROLL_PITCH_THRESHOLD: i32 = 50;
pub const ROLL_YAW_SCALER: f32 = 0.7;

const THROTTLE_STEP: u8 = 5;

/// Receives the full axis tuple after every change.
pub trait ControlListener {
    fn on_control_update(&mut self, throttle: u8, pitch: i8, roll: i8, yaw: i8, bound: bool);
}

pub struct QuadModel {
    throttle: u8,
    pitch: i8,
    roll: i8,
    yaw: i8,
    bound: bool,
    listeners: Listeners<dyn ControlListener>,
}

impl QuadModel {
    pub fn new() -> Self {
        Self {
            throttle: MIN_THROTTLE,
            pitch: 0,
            roll: 0,
            yaw: 0,
            bound: false,
            listeners: Listeners::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Rc<RefCell<dyn ControlListener>>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&mut self, listener: &Rc<RefCell<dyn ControlListener>>) {
        self.listeners.remove(listener);
    }

    pub fn throttle(&self) -> u8 {
        self.throttle
    }

    pub fn pitch(&self) -> i8 {
        self.pitch
    }

    pub fn roll(&self) -> i8 {
        self.roll
    }

    pub fn yaw(&self) -> i8 {
        self.yaw
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Step the throttle up, snapping to the ceiling from within one step of
    /// it. Already at the ceiling: nothing happens, nobody is notified.
    pub fn throttle_up(&mut self) {
        if self.throttle == MAX_THROTTLE {
            return;
        } else if self.throttle > MAX_THROTTLE - THROTTLE_STEP {
            self.throttle = MAX_THROTTLE;
        } else {
            self.throttle += THROTTLE_STEP;
        }

        self.notify_listeners();
    }

    pub fn throttle_down(&mut self) {
        if self.throttle == MIN_THROTTLE {
            return;
        } else if self.throttle < MIN_THROTTLE + THROTTLE_STEP {
            self.throttle = MIN_THROTTLE;
        } else {
            self.throttle -= THROTTLE_STEP;
        }

        self.notify_listeners();
    }

    /// The peer accepted the bind; throttle input is live from here on.
    pub fn bind(&mut self) {
        self.bound = true;
        self.notify_listeners();
    }

    /// Zero everything and drop the bound flag; used when a session ends.
    pub fn reset(&mut self) {
        self.throttle = MIN_THROTTLE;
        self.pitch = 0;
        self.roll = 0;
        self.yaw = 0;
        self.bound = false;

        self.notify_listeners();
    }

    fn notify_listeners(&self) {
        let (throttle, pitch, roll, yaw, bound) =
            (self.throttle, self.pitch, self.roll, self.yaw, self.bound);
        self.listeners
            .notify(|l| l.on_control_update(throttle, pitch, roll, yaw, bound));
    }
}

impl Default for QuadModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionListener for QuadModel {
    fn on_motion(&mut self, x: f32, y: f32, _z: f32, max_magnitude: f32) {
        let norm_x = x / max_magnitude;
        let norm_y = y / max_magnitude;

        let yaw = (norm_x * MAX_AXIS as f32 * YAW_SCALER).round() as i32;
        let pitch = (norm_y * MIN_AXIS as f32 * PITCH_SCALER).round() as i32;

        // Roll tracks yaw once the stick is pitched far enough forward. It is
        // derived from yaw before either axis is clamped.
        let roll = if pitch >= ROLL_PITCH_THRESHOLD {
            (yaw as f32 * ROLL_YAW_SCALER).round() as i32
        } else {
            0
        };

        self.yaw = yaw.clamp(MIN_AXIS, MAX_AXIS) as i8;
        self.pitch = pitch.clamp(MIN_AXIS, MAX_AXIS) as i8;
        self.roll = roll.clamp(MIN_AXIS, MAX_AXIS) as i8;

        self.notify_listeners();
    }
}
