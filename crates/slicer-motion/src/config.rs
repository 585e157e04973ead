//! Per-feature path configuration.
//!
//! Every planned path refers to its configuration through a [`ConfigId`]
//! handed out by a [`PathConfigs`] table. Two paths share a configuration
//! exactly when their ids are equal.

use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::error::{PlannerError, Result};
use crate::geometry::Coord;
use crate::settings::PlannerSettings;

/// Stable handle for a registered [`PathConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId(usize);

impl ConfigId {
    /// The travel configuration, always registered first.
    pub const TRAVEL: ConfigId = ConfigId(0);
}

/// How one kind of line is printed: speed, width and feature label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfig {
    /// Feature label written as a type marker (e.g. `WALL-OUTER`).
    pub name: String,
    /// Target speed (mm/s).
    pub speed: f64,
    /// Extrusion line width (microns). Zero means travel.
    pub line_width: Coord,
    /// Raise Z continuously along the path (vase mode).
    pub spiralize: bool,
    /// Corner pre-compensation distance (microns). Zero disables it.
    pub stretch_distance: Coord,
}

impl PathConfig {
    /// Non-extruding travel configuration.
    pub fn travel(speed: f64) -> Self {
        Self {
            name: "MOVE".into(),
            speed,
            line_width: 0,
            spiralize: false,
            stretch_distance: 0,
        }
    }

    /// Extruding configuration.
    pub fn extrusion(name: impl Into<String>, speed: f64, line_width: Coord) -> Self {
        Self {
            name: name.into(),
            speed,
            line_width,
            spiralize: false,
            stretch_distance: 0,
        }
    }

    /// Enable corner stretching by `distance` microns.
    pub fn with_stretch(mut self, distance: Coord) -> Self {
        self.stretch_distance = distance;
        self
    }

    /// Set the spiralize flag.
    pub fn with_spiralize(mut self, spiralize: bool) -> Self {
        self.spiralize = spiralize;
        self
    }

    /// True for non-extruding moves.
    pub fn is_travel(&self) -> bool {
        self.line_width == 0
    }
}

/// Interning table of path configurations for one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathConfigs {
    configs: Vec<PathConfig>,
}

impl PathConfigs {
    /// Create a table whose first entry is the travel configuration.
    pub fn new(travel: PathConfig) -> Self {
        Self {
            configs: vec![travel],
        }
    }

    /// Register a configuration and return its handle.
    pub fn register(&mut self, config: PathConfig) -> ConfigId {
        self.configs.push(config);
        ConfigId(self.configs.len() - 1)
    }

    /// Whether `id` belongs to this table.
    pub fn contains(&self, id: ConfigId) -> bool {
        id.0 < self.configs.len()
    }

    /// Look up a configuration.
    pub fn get(&self, id: ConfigId) -> Option<&PathConfig> {
        self.configs.get(id.0)
    }

    /// Look up a configuration, failing for foreign ids.
    pub fn try_get(&self, id: ConfigId) -> Result<&PathConfig> {
        self.get(id).ok_or(PlannerError::UnknownConfig(id))
    }

    /// The travel configuration.
    pub fn travel(&self) -> &PathConfig {
        &self.configs[ConfigId::TRAVEL.0]
    }

    /// Change the speed of one configuration.
    pub fn set_speed(&mut self, id: ConfigId, speed: f64) -> Result<()> {
        let config = self
            .configs
            .get_mut(id.0)
            .ok_or(PlannerError::UnknownConfig(id))?;
        config.speed = speed;
        Ok(())
    }

    /// Number of registered configurations, travel included.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Never true: the travel configuration is always present.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Iterate over `(id, config)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ConfigId, &PathConfig)> {
        self.configs.iter().enumerate().map(|(i, c)| (ConfigId(i), c))
    }

    /// Copy of this table with the first-layer speed ramp applied.
    ///
    /// Below `initial_speedup_layers` every extrusion speed is blended from
    /// `initial_layer_speed` towards its nominal value. Travel keeps its speed.
    pub fn ramped(&self, layer_nr: usize, settings: &PlannerSettings) -> Self {
        let configs = self
            .configs
            .iter()
            .map(|config| {
                let mut config = config.clone();
                if !config.is_travel() {
                    config.speed = settings.ramped_speed(config.speed, layer_nr);
                }
                config
            })
            .collect();
        Self { configs }
    }
}

impl Index<ConfigId> for PathConfigs {
    type Output = PathConfig;

    /// Panics for ids not handed out by this table; use [`PathConfigs::get`]
    /// for untrusted ids.
    fn index(&self, id: ConfigId) -> &PathConfig {
        &self.configs[id.0]
    }
}

/// Filament retraction parameters for one extruder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetractionConfig {
    /// Retraction length (mm of filament).
    pub amount: f64,
    /// Retraction speed (mm/s).
    pub speed: f64,
    /// Speed for pushing the filament back (mm/s).
    pub prime_speed: f64,
    /// Nozzle lift while retracted (microns).
    pub z_hop: Coord,
}

impl Default for RetractionConfig {
    fn default() -> Self {
        Self {
            amount: 4.5,
            speed: 25.0,
            prime_speed: 25.0,
            z_hop: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut configs = PathConfigs::new(PathConfig::travel(150.0));
        let wall = configs.register(PathConfig::extrusion("WALL-OUTER", 30.0, 400));
        let fill = configs.register(PathConfig::extrusion("FILL", 60.0, 400));

        assert_ne!(wall, fill);
        assert_eq!(configs[wall].name, "WALL-OUTER");
        assert!(configs[ConfigId::TRAVEL].is_travel());
        assert!(configs.travel().is_travel());
        assert_eq!(configs.len(), 3);
    }

    #[test]
    fn test_identical_configs_stay_distinct() {
        let mut configs = PathConfigs::new(PathConfig::travel(150.0));
        let a = configs.register(PathConfig::extrusion("FILL", 60.0, 400));
        let b = configs.register(PathConfig::extrusion("FILL", 60.0, 400));
        assert_ne!(a, b);
        assert_eq!(configs[a], configs[b]);
    }

    #[test]
    fn test_foreign_id() {
        let mut big = PathConfigs::new(PathConfig::travel(150.0));
        big.register(PathConfig::extrusion("FILL", 60.0, 400));
        let foreign = big.register(PathConfig::extrusion("SKIN", 40.0, 400));

        let mut small = PathConfigs::new(PathConfig::travel(150.0));
        assert!(!small.contains(foreign));
        assert!(small.get(foreign).is_none());
        assert!(matches!(
            small.set_speed(foreign, 10.0),
            Err(PlannerError::UnknownConfig(_))
        ));
    }

    #[test]
    fn test_ramped_keeps_travel_speed() {
        let mut configs = PathConfigs::new(PathConfig::travel(150.0));
        let fill = configs.register(PathConfig::extrusion("FILL", 60.0, 400));
        let settings = PlannerSettings {
            initial_layer_speed: 20.0,
            initial_speedup_layers: 4,
            ..Default::default()
        };

        let layer0 = configs.ramped(0, &settings);
        assert_eq!(layer0.travel().speed, 150.0);
        assert_eq!(layer0[fill].speed, 20.0);

        let layer2 = configs.ramped(2, &settings);
        assert_eq!(layer2[fill].speed, 40.0);

        let layer9 = configs.ramped(9, &settings);
        assert_eq!(layer9[fill].speed, 60.0);
    }
}
