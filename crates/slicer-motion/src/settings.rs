//! Planner and machine settings.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RetractionConfig;
use crate::cooling::CoolingSettings;
use crate::error::{PlannerError, Result};
use crate::geometry::Coord;

/// Settings that drive layer planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Travel speed (mm/s).
    pub travel_speed: f64,
    /// Travels shorter than this never retract (microns).
    pub retraction_min_distance: Coord,
    /// Minimum time a layer must take (s).
    pub min_layer_time: f64,
    /// Extrusion speed floor when slowing down for layer time (mm/s).
    pub min_speed: f64,
    /// Print speed of the first layer (mm/s).
    pub initial_layer_speed: f64,
    /// Number of layers over which speeds ramp up to nominal.
    pub initial_speedup_layers: usize,
    /// How far to step back inside the comb boundary after a part (microns).
    pub move_inside_distance: Coord,
    /// Filament diameter (mm).
    pub filament_diameter: f64,
    /// Lift the head and dwell when a layer is still too fast.
    pub cool_head_lift: bool,
    /// Retraction parameters.
    pub retraction: RetractionConfig,
    /// Fan control.
    pub cooling: CoolingSettings,
    /// Firmware motion limits used for time estimation.
    pub machine: MachineLimits,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            travel_speed: 150.0,
            retraction_min_distance: 1500,
            min_layer_time: 5.0,
            min_speed: 10.0,
            initial_layer_speed: 20.0,
            initial_speedup_layers: 4,
            move_inside_distance: 800,
            filament_diameter: 1.75,
            cool_head_lift: false,
            retraction: RetractionConfig::default(),
            cooling: CoolingSettings::default(),
            machine: MachineLimits::default(),
        }
    }
}

impl PlannerSettings {
    /// Parse settings from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let settings: Self = toml::from_str(source)?;
        settings.validate()?;
        debug!(
            travel_speed = settings.travel_speed,
            min_layer_time = settings.min_layer_time,
            machine = %settings.machine.name,
            "Loaded planner settings"
        );
        Ok(settings)
    }

    /// Validate settings.
    pub fn validate(&self) -> Result<()> {
        if self.travel_speed <= 0.0 {
            return Err(PlannerError::InvalidSettings(
                "travel_speed must be positive".into(),
            ));
        }
        if self.retraction_min_distance < 0 {
            return Err(PlannerError::InvalidSettings(
                "retraction_min_distance must not be negative".into(),
            ));
        }
        if self.min_layer_time < 0.0 {
            return Err(PlannerError::InvalidSettings(
                "min_layer_time must not be negative".into(),
            ));
        }
        if self.min_speed <= 0.0 {
            return Err(PlannerError::InvalidSettings(
                "min_speed must be positive".into(),
            ));
        }
        if self.initial_layer_speed <= 0.0 {
            return Err(PlannerError::InvalidSettings(
                "initial_layer_speed must be positive".into(),
            ));
        }
        if self.filament_diameter <= 0.0 {
            return Err(PlannerError::InvalidSettings(
                "filament_diameter must be positive".into(),
            ));
        }
        if self.retraction.amount < 0.0 || self.retraction.speed <= 0.0 {
            return Err(PlannerError::InvalidSettings(
                "retraction needs a non-negative amount and a positive speed".into(),
            ));
        }
        self.cooling.validate()?;
        self.machine.validate()
    }

    /// Speed for `layer_nr` given the nominal `target`, blending from the
    /// first-layer speed over the speed-up layers.
    pub fn ramped_speed(&self, target: f64, layer_nr: usize) -> f64 {
        let n = self.initial_speedup_layers;
        if layer_nr >= n {
            return target;
        }
        let layer = layer_nr as f64;
        let n = n as f64;
        target * layer / n + self.initial_layer_speed * (n - layer) / n
    }

    /// Cross-section of the filament (mm²).
    pub fn filament_area(&self) -> f64 {
        std::f64::consts::PI * (self.filament_diameter / 2.0).powi(2)
    }
}

/// Firmware kinematic limits, per axis in X, Y, Z, E order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineLimits {
    /// Profile name.
    pub name: String,
    /// Maximum feedrate per axis (mm/s).
    pub max_feedrate: [f64; 4],
    /// Maximum acceleration per axis (mm/s²).
    pub max_acceleration: [f64; 4],
    /// Default acceleration (mm/s²).
    pub acceleration: f64,
    /// Maximum instantaneous XY speed change (mm/s).
    pub max_xy_jerk: f64,
    /// Maximum instantaneous Z speed change (mm/s).
    pub max_z_jerk: f64,
    /// Maximum instantaneous E speed change (mm/s).
    pub max_e_jerk: f64,
    /// Slowest feedrate the planner will use (mm/s).
    pub minimum_feedrate: f64,
}

impl Default for MachineLimits {
    fn default() -> Self {
        Self::generic()
    }
}

impl MachineLimits {
    /// Conservative limits matching common Marlin defaults.
    pub fn generic() -> Self {
        Self {
            name: "Generic".into(),
            max_feedrate: [600.0, 600.0, 40.0, 25.0],
            max_acceleration: [9000.0, 9000.0, 100.0, 10000.0],
            acceleration: 3000.0,
            max_xy_jerk: 20.0,
            max_z_jerk: 0.4,
            max_e_jerk: 5.0,
            minimum_feedrate: 0.01,
        }
    }

    /// Creality Ender 3 limits.
    pub fn ender3() -> Self {
        Self {
            name: "Creality Ender 3".into(),
            max_feedrate: [500.0, 500.0, 5.0, 25.0],
            max_acceleration: [500.0, 500.0, 100.0, 5000.0],
            acceleration: 500.0,
            max_xy_jerk: 10.0,
            max_z_jerk: 0.4,
            max_e_jerk: 5.0,
            minimum_feedrate: 0.01,
        }
    }

    /// Prusa MK4 limits.
    pub fn prusa_mk4() -> Self {
        Self {
            name: "Prusa MK4".into(),
            max_feedrate: [200.0, 200.0, 12.0, 120.0],
            max_acceleration: [4000.0, 4000.0, 200.0, 2500.0],
            acceleration: 4000.0,
            max_xy_jerk: 8.0,
            max_z_jerk: 2.0,
            max_e_jerk: 10.0,
            minimum_feedrate: 0.01,
        }
    }

    /// Voron 2.4 (Klipper) limits.
    pub fn voron_24() -> Self {
        Self {
            name: "Voron 2.4 (350mm)".into(),
            max_feedrate: [300.0, 300.0, 15.0, 60.0],
            max_acceleration: [5000.0, 5000.0, 350.0, 5000.0],
            acceleration: 5000.0,
            max_xy_jerk: 20.0,
            max_z_jerk: 0.4,
            max_e_jerk: 5.0,
            minimum_feedrate: 0.01,
        }
    }

    /// Get all built-in profiles.
    pub fn all_profiles() -> Vec<Self> {
        vec![
            Self::generic(),
            Self::ender3(),
            Self::prusa_mk4(),
            Self::voron_24(),
        ]
    }

    /// Validate limits.
    pub fn validate(&self) -> Result<()> {
        let positive = |values: &[f64]| values.iter().all(|v| *v > 0.0);
        if !positive(&self.max_feedrate) || !positive(&self.max_acceleration) {
            return Err(PlannerError::InvalidSettings(format!(
                "machine '{}': axis limits must be positive",
                self.name
            )));
        }
        if self.acceleration <= 0.0 || self.minimum_feedrate <= 0.0 {
            return Err(PlannerError::InvalidSettings(format!(
                "machine '{}': acceleration and minimum_feedrate must be positive",
                self.name
            )));
        }
        Ok(())
    }
}
