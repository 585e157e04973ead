#![warn(missing_docs)]

//! Toolpath planning and motion sequencing for 3D printing.
//!
//! This crate takes the per-layer feature geometry a slicer produces (wall
//! loops, infill and support lines) and turns it into ordered, timed head
//! motion: it picks the order paths are printed in, routes travel moves
//! around holes, decides where to retract, slows small layers down and
//! estimates how long everything takes.
//!
//! # Example
//!
//! ```ignore
//! use slicer_motion::{plan_print, Feature, LayerInput, PathConfig, PathConfigs, PlannerSettings};
//!
//! let settings = PlannerSettings::default();
//! let mut configs = PathConfigs::new(PathConfig::travel(settings.travel_speed));
//! let wall = configs.register(PathConfig::extrusion("WALL-OUTER", 40.0, 450));
//!
//! let layers: Vec<LayerInput> = // ... walls and infill per layer
//! let result = plan_print(&layers, &configs, &settings)?;
//!
//! println!("Moves: {}", result.commands.len());
//! println!("Print time: {:.0}s", result.print_time_seconds);
//! ```

pub mod comb;
pub mod config;
pub mod cooling;
pub mod error;
pub mod export;
pub mod geometry;
pub mod layer_plan;
pub mod order;
pub mod settings;
pub mod time_estimate;

pub use comb::Comb;
pub use config::{ConfigId, PathConfig, PathConfigs, RetractionConfig};
pub use cooling::{fan_speed, CoolingSettings};
pub use error::{PlannerError, Result};
pub use export::{CommandRecorder, MotionCommand, MotionSink};
pub use geometry::{int_to_mm, mm_to_int, Coord, Point, PointMatrix, Polygon, Polygons};
pub use layer_plan::{GCodePath, LayerPlan, LayerStats};
pub use order::PathOrderOptimizer;
pub use settings::{MachineLimits, PlannerSettings};
pub use time_estimate::{Position, TimeEstimateCalculator};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How the loops of a feature are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Closed loops (walls, skin outlines).
    #[default]
    Polygons,
    /// Open lines (infill, support).
    Lines,
}

/// One printed feature of a layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Configuration every path of the feature is printed with.
    pub config: ConfigId,
    /// Closed loops or open lines.
    #[serde(default)]
    pub kind: FeatureKind,
    /// Extruder printing the feature.
    #[serde(default)]
    pub extruder: usize,
    /// Geometry; with [`FeatureKind::Lines`] each entry is an open line.
    pub paths: Polygons,
}

/// Geometry of one layer, ready for motion planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerInput {
    /// Nozzle height (microns).
    pub z: Coord,
    /// Layer thickness (microns).
    pub thickness: Coord,
    /// Region travel stays inside, usually the outline of the part.
    #[serde(default)]
    pub comb_boundary: Option<Polygons>,
    /// Features in print order.
    pub features: Vec<Feature>,
}

/// Result of planning a whole print.
#[derive(Debug, Clone, Serialize)]
pub struct PrintResult {
    /// Command stream for all layers.
    pub commands: Vec<MotionCommand>,
    /// Per-layer statistics.
    pub layers: Vec<LayerStats>,
    /// Estimated print time including dwells (s).
    pub print_time_seconds: f64,
    /// Extruded volume per extruder (mm³).
    pub filament_volume: Vec<f64>,
    /// Filament length per extruder (mm).
    pub filament_mm: Vec<f64>,
}

/// Plan every layer of a print.
///
/// For each layer this:
/// 1. Applies the first-layer speed ramp to the configurations
/// 2. Orders and adds every feature, combing travel inside the boundary
/// 3. Enforces the minimum layer time
/// 4. Sets the fan from how much the layer was slowed down
/// 5. Writes the layer into a [`CommandRecorder`]
pub fn plan_print(
    layers: &[LayerInput],
    configs: &PathConfigs,
    settings: &PlannerSettings,
) -> Result<PrintResult> {
    settings.validate()?;
    for feature in layers.iter().flat_map(|layer| &layer.features) {
        configs.try_get(feature.config)?;
    }

    let mut sink = CommandRecorder::new(settings);
    let mut layer_stats = Vec::with_capacity(layers.len());

    for (layer_nr, layer) in layers.iter().enumerate() {
        let layer_configs = configs.ramped(layer_nr, settings);
        sink.set_layer_thickness(layer.thickness);

        let mut plan = LayerPlan::new(
            layer_nr,
            sink.position_xy(),
            layer.z,
            settings,
            &layer_configs,
            sink.extruder(),
        );
        plan.set_comb_boundary(layer.comb_boundary.as_ref());

        for feature in &layer.features {
            plan.set_extruder(feature.extruder);
            match feature.kind {
                FeatureKind::Polygons => {
                    plan.add_polygons_by_optimizer(&feature.paths, feature.config);
                    // A spiral wall leads straight into the next layer.
                    let spiral = layer_configs
                        .get(feature.config)
                        .is_some_and(|config| config.spiralize);
                    if !spiral {
                        plan.move_inside_comb_boundary(settings.move_inside_distance);
                    }
                }
                FeatureKind::Lines => plan.add_lines_by_optimizer(&feature.paths, feature.config),
            }
        }

        plan.force_minimal_layer_time(settings.min_layer_time, settings.min_speed);
        let fan = fan_speed(plan.extrude_speed_factor(), layer_nr, &settings.cooling);

        sink.write_comment(&format!("LAYER:{layer_nr}"));
        sink.write_fan_speed(fan);
        let stats = plan.write_gcode(&mut sink, settings.cool_head_lift, layer.thickness);
        debug!(
            layer_nr,
            time = stats.estimated_time,
            factor = stats.extrude_speed_factor,
            fan,
            "Layer planned"
        );
        layer_stats.push(stats);
    }

    let filament_area = settings.filament_area();
    let filament_volume = sink.filament_used().to_vec();
    let filament_mm = filament_volume.iter().map(|v| v / filament_area).collect();
    let print_time_seconds = sink.total_print_time();

    info!(
        layers = layer_stats.len(),
        print_time_seconds,
        "Print planned"
    );

    Ok(PrintResult {
        commands: sink.take_commands(),
        layers: layer_stats,
        print_time_seconds,
        filament_volume,
        filament_mm,
    })
}
