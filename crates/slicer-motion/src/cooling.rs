//! Part cooling fan derived from how much a layer was slowed down.
//!
//! A layer whose extrusion speed had to be cut to meet the minimum layer
//! time is small and hot, so it gets more fan. The first layers ramp the
//! fan up from off so the part sticks to the bed.

use serde::{Deserialize, Serialize};

use crate::error::{PlannerError, Result};

/// Fan control settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolingSettings {
    /// Fan speed at full extrusion speed (percent).
    pub fan_speed_min: f64,
    /// Fan speed once extrusion is slowed to half speed or less (percent).
    pub fan_speed_max: f64,
    /// First layer at which the fan may run at full computed speed.
    pub fan_full_on_layer: usize,
}

impl Default for CoolingSettings {
    fn default() -> Self {
        Self {
            fan_speed_min: 100.0,
            fan_speed_max: 100.0,
            fan_full_on_layer: 2,
        }
    }
}

impl CoolingSettings {
    /// Create cooling settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fan speed range (percent).
    pub fn with_fan_speeds(mut self, min: f64, max: f64) -> Self {
        self.fan_speed_min = min;
        self.fan_speed_max = max;
        self
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        if !in_range(self.fan_speed_min) || !in_range(self.fan_speed_max) {
            return Err(PlannerError::InvalidSettings(
                "fan speeds must be between 0 and 100 percent".into(),
            ));
        }
        if self.fan_speed_min > self.fan_speed_max {
            return Err(PlannerError::InvalidSettings(
                "fan_speed_min exceeds fan_speed_max".into(),
            ));
        }
        Ok(())
    }
}

/// Fan speed in percent for a layer printed at `extrude_speed_factor`
/// percent of nominal speed.
pub fn fan_speed(extrude_speed_factor: f64, layer_nr: usize, settings: &CoolingSettings) -> f64 {
    let mut speed = if extrude_speed_factor <= 50.0 {
        settings.fan_speed_max
    } else {
        let n = (extrude_speed_factor - 50.0).min(50.0);
        settings.fan_speed_min * n / 50.0 + settings.fan_speed_max * (50.0 - n) / 50.0
    };
    if layer_nr < settings.fan_full_on_layer {
        speed = speed * layer_nr as f64 / settings.fan_full_on_layer as f64;
    }
    speed
}
