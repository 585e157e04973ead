//! Motion output: the sink a [`LayerPlan`](crate::LayerPlan) writes into.
//!
//! [`MotionSink`] is the boundary to whatever turns planned motion into
//! machine code. [`CommandRecorder`] is the bundled implementation: it keeps
//! the head position, feeds every move into a [`TimeEstimateCalculator`],
//! accounts filament per extruder and records a serializable command stream.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetractionConfig;
use crate::geometry::{int_to_mm, Coord, Point};
use crate::settings::PlannerSettings;
use crate::time_estimate::{Position, TimeEstimateCalculator};

/// Receiver of planned motion.
pub trait MotionSink {
    /// Current head position in the XY plane.
    fn position_xy(&self) -> Point;

    /// Current head height (microns).
    fn position_z(&self) -> Coord;

    /// Set the height used by following moves.
    fn set_z(&mut self, z: Coord);

    /// Active extruder.
    fn extruder(&self) -> usize;

    /// Move to `p` at `speed` mm/s, extruding a line `line_width` microns
    /// wide. A zero width is a travel.
    fn write_move(&mut self, p: Point, speed: f64, line_width: Coord);

    /// Retract the filament of the active extruder.
    fn write_retraction(&mut self);

    /// Change the active extruder.
    fn switch_extruder(&mut self, extruder: usize);

    /// Mark the start of a feature (`WALL-OUTER`, `FILL`, ...).
    fn write_feature_type(&mut self, name: &str);

    /// Free-form comment.
    fn write_comment(&mut self, text: &str);

    /// Dwell for `seconds`.
    fn write_delay(&mut self, seconds: f64);

    /// Set the part cooling fan, in percent.
    fn write_fan_speed(&mut self, percent: f64);

    /// Fold the time of everything written since the last call into the
    /// running total and return it.
    fn update_total_print_time(&mut self) -> f64;
}

/// One entry of the recorded command stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotionCommand {
    /// Linear move.
    Move {
        /// Destination X (microns).
        x: Coord,
        /// Destination Y (microns).
        y: Coord,
        /// Destination Z (microns).
        z: Coord,
        /// Speed (mm/s).
        speed: f64,
        /// Extrusion width (microns). Zero for travel.
        line_width: Coord,
        /// Extruder executing the move.
        extruder: usize,
        /// Filament was retracted right before this move.
        retract_before: bool,
        /// Absolute extruder position after the move (mm of filament).
        e: f64,
    },
    /// Tool change.
    SwitchExtruder {
        /// Previous extruder.
        from: usize,
        /// New extruder.
        to: usize,
    },
    /// Feature marker.
    FeatureType {
        /// Feature label.
        name: String,
    },
    /// Comment.
    Comment {
        /// Text.
        text: String,
    },
    /// Dwell.
    Dwell {
        /// Duration (s).
        seconds: f64,
    },
    /// Fan speed change.
    Fan {
        /// Fan speed (percent).
        percent: f64,
    },
}

/// Records motion as [`MotionCommand`]s and keeps print statistics.
#[derive(Debug, Clone)]
pub struct CommandRecorder {
    commands: Vec<MotionCommand>,
    estimator: TimeEstimateCalculator,
    retraction: RetractionConfig,
    filament_area: f64,
    layer_thickness: Coord,
    position: Point,
    z: Coord,
    written_z: Coord,
    extruder: usize,
    e: f64,
    retracted: bool,
    retract_pending: bool,
    filament_used: Vec<f64>,
    total_print_time: f64,
}

impl CommandRecorder {
    /// Create a recorder using the machine limits, filament and retraction
    /// from `settings`.
    pub fn new(settings: &PlannerSettings) -> Self {
        Self {
            commands: Vec::new(),
            estimator: TimeEstimateCalculator::with_limits(&settings.machine),
            retraction: settings.retraction,
            filament_area: settings.filament_area(),
            layer_thickness: 200,
            position: Point::default(),
            z: 0,
            written_z: 0,
            extruder: 0,
            e: 0.0,
            retracted: false,
            retract_pending: false,
            filament_used: vec![0.0],
            total_print_time: 0.0,
        }
    }

    /// Layer height used to turn line width into extruded volume (microns).
    pub fn set_layer_thickness(&mut self, thickness: Coord) {
        self.layer_thickness = thickness;
    }

    /// Place the head without recording a move.
    pub fn set_position(&mut self, p: Point) {
        self.position = p;
        self.sync_estimator();
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> &[MotionCommand] {
        &self.commands
    }

    /// Take the recorded commands, leaving the stream empty.
    pub fn take_commands(&mut self) -> Vec<MotionCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Extruded volume per extruder (mm³).
    pub fn filament_used(&self) -> &[f64] {
        &self.filament_used
    }

    /// Total estimated print time so far (s).
    pub fn total_print_time(&self) -> f64 {
        self.total_print_time
    }

    /// Whether the filament is currently retracted.
    pub fn is_retracted(&self) -> bool {
        self.retracted
    }

    /// Head height including any retraction hop.
    fn head_z(&self) -> Coord {
        if self.retracted && self.retraction.z_hop > 0 {
            self.z + self.retraction.z_hop
        } else {
            self.z
        }
    }

    fn estimator_position(&self) -> Position {
        let e = if self.retracted {
            self.e - self.retraction.amount
        } else {
            self.e
        };
        Position::new(
            int_to_mm(self.position.x),
            int_to_mm(self.position.y),
            int_to_mm(self.head_z()),
            e,
        )
    }

    fn sync_estimator(&mut self) {
        let position = self.estimator_position();
        self.estimator.set_position(position);
    }

    fn ensure_extruder_slot(&mut self, extruder: usize) {
        if self.filament_used.len() <= extruder {
            self.filament_used.resize(extruder + 1, 0.0);
        }
    }
}

impl MotionSink for CommandRecorder {
    fn position_xy(&self) -> Point {
        self.position
    }

    fn position_z(&self) -> Coord {
        self.z
    }

    fn set_z(&mut self, z: Coord) {
        self.z = z;
    }

    fn extruder(&self) -> usize {
        self.extruder
    }

    fn write_move(&mut self, p: Point, speed: f64, line_width: Coord) {
        if p == self.position && self.head_z() == self.written_z {
            return;
        }
        if line_width < 0 {
            warn!(?p, line_width, "Negative extrusion width, moving without extruding");
        }

        if line_width > 0 {
            if self.retracted {
                // Prime in place before extruding.
                self.retracted = false;
                let primed = self.estimator_position();
                self.estimator.plan(primed, self.retraction.prime_speed);
            }
            let length = (p - self.position).length_mm();
            let volume = length * int_to_mm(line_width) * int_to_mm(self.layer_thickness);
            self.e += volume / self.filament_area;
            self.ensure_extruder_slot(self.extruder);
            self.filament_used[self.extruder] += volume;
        }

        self.position = p;
        self.written_z = self.head_z();
        let target = self.estimator_position();
        self.estimator.plan(target, speed);

        let retract_before = std::mem::take(&mut self.retract_pending);
        self.commands.push(MotionCommand::Move {
            x: p.x,
            y: p.y,
            z: self.written_z,
            speed,
            line_width: line_width.max(0),
            extruder: self.extruder,
            retract_before,
            e: target.0.w,
        });
    }

    fn write_retraction(&mut self) {
        if self.retracted || self.retraction.amount <= 0.0 {
            return;
        }
        self.retracted = true;
        self.retract_pending = true;
        let target = self.estimator_position();
        self.estimator.plan(target, self.retraction.speed);
    }

    fn switch_extruder(&mut self, extruder: usize) {
        if extruder == self.extruder {
            return;
        }
        if !self.retracted {
            self.write_retraction();
        }
        debug!(from = self.extruder, to = extruder, "Extruder switch");
        self.commands.push(MotionCommand::SwitchExtruder {
            from: self.extruder,
            to: extruder,
        });
        self.extruder = extruder;
        self.ensure_extruder_slot(extruder);
    }

    fn write_feature_type(&mut self, name: &str) {
        self.commands.push(MotionCommand::FeatureType { name: name.into() });
    }

    fn write_comment(&mut self, text: &str) {
        self.commands.push(MotionCommand::Comment { text: text.into() });
    }

    fn write_delay(&mut self, seconds: f64) {
        self.commands.push(MotionCommand::Dwell { seconds });
        self.total_print_time += seconds;
    }

    fn write_fan_speed(&mut self, percent: f64) {
        self.commands.push(MotionCommand::Fan { percent });
    }

    fn update_total_print_time(&mut self) -> f64 {
        let time = self.estimator.calculate();
        self.estimator.reset();
        self.total_print_time += time;
        time
    }
}
