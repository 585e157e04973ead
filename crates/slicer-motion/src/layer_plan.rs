//! Per-layer motion planning.
//!
//! A [`LayerPlan`] collects the travel and extrusion moves of one layer into
//! [`GCodePath`]s, deciding along the way where to comb and where to
//! retract. Before emission it can slow the layer down to respect a minimum
//! layer time; [`LayerPlan::write_gcode`] then streams the paths into a
//! [`MotionSink`], merging tiny zig-zag moves, ramping Z for vase mode and
//! pre-compensating corners.

use serde::Serialize;
use tracing::{debug, debug_span, warn, Span};

use crate::comb::Comb;
use crate::config::{ConfigId, PathConfig, PathConfigs};
use crate::export::MotionSink;
use crate::geometry::{circle_center, Coord, Point, Polygons};
use crate::order::PathOrderOptimizer;
use crate::settings::PlannerSettings;

/// Height the head is raised by when waiting out a short layer.
const HEAD_LIFT_HEIGHT: Coord = 3000;

/// Sideways move away from the print while waiting.
const HEAD_LIFT_MOVE: Coord = 20000;

/// Leftover layer time below this is not worth a dwell (s).
const MIN_EXTRA_TIME: f64 = 0.1;

/// Speeds below this are treated as this when timing paths (mm/s).
const MIN_TIMING_SPEED: f64 = 0.001;

/// A run of moves sharing one configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GCodePath {
    /// Configuration of every move in the path.
    pub config: ConfigId,
    /// Retract before the first move.
    pub retract: bool,
    /// Extruder printing the path.
    pub extruder: usize,
    /// Destinations, in order.
    pub points: Vec<Point>,
    /// Closed for appending; the next move opens a new path.
    pub done: bool,
}

impl GCodePath {
    fn new(config: ConfigId, extruder: usize) -> Self {
        Self {
            config,
            retract: false,
            extruder,
            points: Vec::new(),
            done: false,
        }
    }
}

/// What writing one layer produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStats {
    /// Layer index.
    pub layer_nr: usize,
    /// Time from the look-ahead estimator (s).
    pub estimated_time: f64,
    /// Time from path lengths and speeds after slowdown (s).
    pub planned_time: f64,
    /// Dwell added to reach the minimum layer time (s).
    pub extra_time: f64,
    /// Extrusion speed factor used (percent).
    pub extrude_speed_factor: f64,
    /// Retractions and extruder switches requested from the sink. A sink
    /// that is already retracted may ignore some, so this is an upper bound.
    pub retractions: usize,
    /// Moves requested from the sink, including ones it drops because the
    /// head is already there.
    pub moves: usize,
}

/// Motion plan for one layer.
#[derive(Debug)]
pub struct LayerPlan<'a> {
    layer_nr: usize,
    z: Coord,
    configs: &'a PathConfigs,
    retraction_min_distance: Coord,
    start_position: Point,
    last_position: Point,
    paths: Vec<GCodePath>,
    comb: Option<Comb<'a>>,
    force_retraction: bool,
    always_retract: bool,
    current_extruder: usize,
    extrude_speed_factor: f64,
    travel_speed_factor: f64,
    extra_time: f64,
    total_print_time: f64,
    span: Span,
}

impl<'a> LayerPlan<'a> {
    /// Start planning layer `layer_nr` at height `z` with the head at
    /// `start_position`.
    pub fn new(
        layer_nr: usize,
        start_position: Point,
        z: Coord,
        settings: &PlannerSettings,
        configs: &'a PathConfigs,
        extruder: usize,
    ) -> Self {
        Self {
            layer_nr,
            z,
            configs,
            retraction_min_distance: settings.retraction_min_distance,
            start_position,
            last_position: start_position,
            paths: Vec::new(),
            comb: None,
            force_retraction: false,
            always_retract: false,
            current_extruder: extruder,
            extrude_speed_factor: 100.0,
            travel_speed_factor: 100.0,
            extra_time: 0.0,
            total_print_time: 0.0,
            span: debug_span!("layer", layer_nr, z),
        }
    }

    /// Layer index.
    pub fn layer_nr(&self) -> usize {
        self.layer_nr
    }

    /// Layer height (microns).
    pub fn z(&self) -> Coord {
        self.z
    }

    /// Planned paths so far.
    pub fn paths(&self) -> &[GCodePath] {
        &self.paths
    }

    /// Where the head will be after the planned moves.
    pub fn last_position(&self) -> Point {
        self.last_position
    }

    /// Extruder new paths are assigned to.
    pub fn extruder(&self) -> usize {
        self.current_extruder
    }

    /// Extrusion speed factor (percent).
    pub fn extrude_speed_factor(&self) -> f64 {
        self.extrude_speed_factor
    }

    /// Travel speed factor (percent).
    pub fn travel_speed_factor(&self) -> f64 {
        self.travel_speed_factor
    }

    /// Dwell to add at the end of the layer (s).
    pub fn extra_time(&self) -> f64 {
        self.extra_time
    }

    /// Layer time as planned by [`force_minimal_layer_time`](Self::force_minimal_layer_time) (s).
    pub fn total_print_time(&self) -> f64 {
        self.total_print_time
    }

    /// Whether travel is currently combed.
    pub fn has_comb(&self) -> bool {
        self.comb.is_some()
    }

    /// Replace the comb boundary. `None` stops combing.
    pub fn set_comb_boundary(&mut self, boundary: Option<&'a Polygons>) {
        self.comb = boundary.map(Comb::new);
    }

    /// Retract on every long travel that is not combed.
    pub fn set_always_retract(&mut self, always_retract: bool) {
        self.always_retract = always_retract;
    }

    /// Retract on the next long travel regardless of combing.
    pub fn force_retract(&mut self) {
        self.force_retraction = true;
    }

    /// Switch to `extruder`. Returns whether it changed.
    pub fn set_extruder(&mut self, extruder: usize) -> bool {
        if extruder == self.current_extruder {
            return false;
        }
        debug!(parent: &self.span, from = self.current_extruder, to = extruder, "Extruder change");
        self.current_extruder = extruder;
        self.force_new_path_start();
        true
    }

    /// Set the extrusion speed factor (percent, at least 1).
    pub fn set_extrude_speed_factor(&mut self, factor: f64) {
        self.extrude_speed_factor = factor.max(1.0);
    }

    /// Set the travel speed factor (percent, at least 1).
    pub fn set_travel_speed_factor(&mut self, factor: f64) {
        self.travel_speed_factor = factor.max(1.0);
    }

    /// Close the current path so the next move starts a new one.
    pub fn force_new_path_start(&mut self) {
        if let Some(last) = self.paths.last_mut() {
            last.done = true;
        }
    }

    fn latest_path_with_config(&mut self, config: ConfigId) -> &mut GCodePath {
        let extruder = self.current_extruder;
        let reusable = matches!(
            self.paths.last(),
            Some(last) if last.config == config && !last.done && last.extruder == extruder
        );
        if !reusable {
            self.paths.push(GCodePath::new(config, extruder));
        }
        let idx = self.paths.len() - 1;
        &mut self.paths[idx]
    }

    /// Plan a travel to `p`, combing or retracting as needed.
    pub fn add_travel(&mut self, p: Point) {
        let from = self.last_position;
        let long_travel = !(from - p).shorter_than(self.retraction_min_distance);
        let mut retract = false;
        let mut vias = Vec::new();

        if self.force_retraction {
            retract = long_travel;
            self.force_retraction = false;
        } else if let Some(comb) = self.comb.as_mut() {
            match comb.calc(from, p) {
                Some(route) => vias = route,
                None => {
                    debug!(parent: &self.span, ?from, to = ?p, "Comb failed, travelling direct");
                    retract = long_travel;
                }
            }
        } else if self.always_retract {
            retract = long_travel;
        }

        let path = self.latest_path_with_config(ConfigId::TRAVEL);
        if retract {
            path.retract = true;
        }
        path.points.extend(vias);
        path.points.push(p);
        self.last_position = p;
    }

    /// Plan an extrusion to `p` with `config`.
    ///
    /// Ids that do not belong to this layer's configuration table are
    /// ignored.
    pub fn add_extrusion_move(&mut self, p: Point, config: ConfigId) {
        if !self.configs.contains(config) {
            warn!(parent: &self.span, ?config, "Extrusion with unknown config skipped");
            return;
        }
        self.latest_path_with_config(config).points.push(p);
        self.last_position = p;
    }

    /// If the head ended outside the comb boundary, step back in by
    /// `distance` and start a fresh path there.
    pub fn move_inside_comb_boundary(&mut self, distance: Coord) {
        let target = {
            let Some(comb) = &self.comb else { return };
            if comb.inside(self.last_position) {
                return;
            }
            let Some(p) = comb.move_inside(self.last_position, distance) else {
                return;
            };
            // Twice, to get out of sharp corners.
            let p = comb.move_inside(p, distance).unwrap_or(p);
            if !comb.inside(p) {
                return;
            }
            p
        };
        self.add_travel(target);
        self.force_new_path_start();
    }

    /// Travel to `points[start_idx]` and print the loop back to it.
    pub fn add_polygon(&mut self, points: &[Point], start_idx: usize, config: ConfigId) {
        let n = points.len();
        if n == 0 {
            return;
        }
        let start_idx = start_idx % n;
        self.add_travel(points[start_idx]);
        for i in 1..n {
            self.add_extrusion_move(points[(start_idx + i) % n], config);
        }
        if n > 2 {
            self.add_extrusion_move(points[start_idx], config);
        }
    }

    /// Travel to one end of an open line and print it to the other end.
    ///
    /// `start_idx` selects the end: `0` prints forward, anything else
    /// prints from the last point backwards.
    pub fn add_polyline(&mut self, points: &[Point], start_idx: usize, config: ConfigId) {
        let Some((&first, rest)) = points.split_first() else {
            return;
        };
        if start_idx == 0 {
            self.add_travel(first);
            for &p in rest {
                self.add_extrusion_move(p, config);
            }
        } else {
            let mut reversed = points.iter().rev();
            if let Some(&last) = reversed.next() {
                self.add_travel(last);
            }
            for &p in reversed {
                self.add_extrusion_move(p, config);
            }
        }
    }

    /// Print closed loops in optimized order.
    pub fn add_polygons_by_optimizer(&mut self, polygons: &Polygons, config: ConfigId) {
        let mut optimizer = PathOrderOptimizer::new(self.last_position);
        for poly in polygons {
            optimizer.add_polygon(&poly.points);
        }
        optimizer.optimize();
        for &i in &optimizer.order {
            self.add_polygon(&polygons[i].points, optimizer.start_indices[i], config);
        }
    }

    /// Print open lines in optimized order, each from its nearer end.
    ///
    /// Every entry of `lines` is an open polyline.
    pub fn add_lines_by_optimizer(&mut self, lines: &Polygons, config: ConfigId) {
        let mut optimizer = PathOrderOptimizer::new(self.last_position);
        for line in lines {
            optimizer.add_polyline(&line.points);
        }
        optimizer.optimize();
        for &i in &optimizer.order {
            self.add_polyline(&lines[i].points, optimizer.start_indices[i], config);
        }
    }

    /// Naive `(travel, extrusion)` times at nominal speeds (s).
    pub fn travel_and_extrude_times(&self) -> (f64, f64) {
        let mut travel_time = 0.0;
        let mut extrude_time = 0.0;
        let mut p0 = self.start_position;
        for path in &self.paths {
            let Some(config) = self.configs.get(path.config) else {
                continue;
            };
            let speed = config.speed.max(MIN_TIMING_SPEED);
            for &p in &path.points {
                let time = (p - p0).length_mm() / speed;
                if config.is_travel() {
                    travel_time += time;
                } else {
                    extrude_time += time;
                }
                p0 = p;
            }
        }
        (travel_time, extrude_time)
    }

    /// Slow extrusion down so the layer takes at least `min_time` seconds,
    /// never below `min_speed` mm/s. Time still missing becomes a dwell.
    pub fn force_minimal_layer_time(&mut self, min_time: f64, min_speed: f64) {
        let (travel_time, extrude_time) = self.travel_and_extrude_times();
        let total_time = travel_time + extrude_time;
        if total_time >= min_time || extrude_time <= 0.0 {
            self.total_print_time = total_time;
            return;
        }

        let min_extrude_time = (min_time - travel_time).max(1.0);
        let mut factor = extrude_time / min_extrude_time;
        for path in &self.paths {
            let Some(config) = self.configs.get(path.config) else {
                continue;
            };
            if config.is_travel() || config.speed <= 0.0 {
                continue;
            }
            if config.speed * factor < min_speed {
                factor = factor.max(min_speed / config.speed);
            }
        }

        // Only slow down further than an earlier slowdown (e.g. first layer).
        if factor * 100.0 < self.extrude_speed_factor {
            self.set_extrude_speed_factor(factor * 100.0);
        } else {
            factor = self.extrude_speed_factor / 100.0;
        }

        let slowed_time = extrude_time / factor + travel_time;
        let shortfall = min_time - slowed_time;
        if shortfall > MIN_EXTRA_TIME {
            self.extra_time = shortfall;
        }
        self.total_print_time = slowed_time;
        debug!(
            parent: &self.span,
            planned = total_time,
            slowed = slowed_time,
            factor = self.extrude_speed_factor,
            extra = self.extra_time,
            "Enforcing minimum layer time"
        );
    }

    /// Stream the plan into `sink`.
    ///
    /// `layer_thickness` is the Z rise applied along a vase-mode path.
    /// With `lift_head_if_needed`, any remaining layer time is spent with
    /// the head lifted away from the print.
    pub fn write_gcode<S: MotionSink + ?Sized>(
        self,
        sink: &mut S,
        lift_head_if_needed: bool,
        layer_thickness: Coord,
    ) -> LayerStats {
        let _enter = self.span.enter();
        let paths = &self.paths;
        let mut last_config: Option<ConfigId> = None;
        let mut extruder = sink.extruder();
        let mut retractions = 0;
        let mut moves = 0;

        sink.set_z(self.z);

        let mut n = 0;
        while n < paths.len() {
            let path = &paths[n];
            let Some(config) = self.configs.get(path.config) else {
                warn!(config = ?path.config, "Path with unknown config skipped");
                n += 1;
                continue;
            };

            if extruder != path.extruder {
                extruder = path.extruder;
                sink.switch_extruder(extruder);
                retractions += 1;
            } else if path.retract {
                sink.write_retraction();
                retractions += 1;
            }
            if !config.is_travel() && last_config != Some(path.config) {
                sink.write_feature_type(&config.name);
                last_config = Some(path.config);
            }
            let speed = if config.is_travel() {
                config.speed * self.travel_speed_factor / 100.0
            } else {
                config.speed * self.extrude_speed_factor / 100.0
            };

            if let Some(next) = self.merge_small_moves(sink, n, config, speed, &mut moves) {
                n = next;
                continue;
            }

            if config.spiralize && self.is_last_spiralize_path(n) {
                moves += write_spiralized_path(sink, &path.points, speed, config.line_width, layer_thickness);
            } else if config.stretch_distance > 0 && !config.is_travel() {
                moves += write_stretched_path(
                    sink,
                    &path.points,
                    speed,
                    config.line_width,
                    config.stretch_distance,
                );
            } else {
                for &p in &path.points {
                    sink.write_move(p, speed, config.line_width);
                    moves += 1;
                }
            }
            n += 1;
        }

        let estimated_time = sink.update_total_print_time();

        if lift_head_if_needed && self.extra_time > 0.0 {
            sink.write_comment("Small layer, adding delay");
            if last_config.is_some() {
                sink.write_retraction();
                retractions += 1;
            }
            let travel_speed = self.configs.travel().speed;
            let z = sink.position_z();
            sink.set_z(z + HEAD_LIFT_HEIGHT);
            let here = sink.position_xy();
            sink.write_move(here, travel_speed, 0);
            sink.write_move(here + Point::new(HEAD_LIFT_MOVE, 0), travel_speed, 0);
            sink.write_delay(self.extra_time);
            moves += 2;
        }

        debug!(
            estimated_time,
            planned_time = self.total_print_time,
            retractions,
            moves,
            "Layer written"
        );

        LayerStats {
            layer_nr: self.layer_nr,
            estimated_time,
            planned_time: self.total_print_time,
            extra_time: self.extra_time,
            extrude_speed_factor: self.extrude_speed_factor,
            retractions,
            moves,
        }
    }

    fn is_last_spiralize_path(&self, n: usize) -> bool {
        !self.paths[n + 1..]
            .iter()
            .any(|p| self.configs.get(p.config).is_some_and(|c| c.spiralize))
    }

    /// Collapse a run of single-point paths close together into fewer,
    /// longer moves. Returns the index of the next path to write when a
    /// run was merged.
    fn merge_small_moves<S: MotionSink + ?Sized>(
        &self,
        sink: &mut S,
        n: usize,
        config: &PathConfig,
        speed: f64,
        moves: &mut usize,
    ) -> Option<usize> {
        let paths = &self.paths;
        let path = &paths[n];
        let reach = config.line_width * 2;
        if path.points.len() != 1
            || config.is_travel()
            || !(sink.position_xy() - path.points[0]).shorter_than(reach)
        {
            return None;
        }

        let mut p0 = path.points[0];
        let mut end = n + 1;
        while end < paths.len()
            && paths[end].points.len() == 1
            && (p0 - paths[end].points[0]).shorter_than(reach)
        {
            p0 = paths[end].points[0];
            end += 1;
        }
        if paths[end - 1].config == ConfigId::TRAVEL {
            end -= 1;
        }
        if end <= n + 2 {
            return None;
        }

        let mut p0 = sink.position_xy();
        let mut x = n;
        while x + 1 < end {
            let a = paths[x].points[0];
            let b = paths[x + 1].points[0];
            let old_len = (p0 - a).length();
            let mid = (a + b) / 2;
            let new_len = (sink.position_xy() - mid).length();
            if new_len > 0.0 && old_len > 0.0 {
                let width = (config.line_width as f64 * old_len / new_len).round() as Coord;
                sink.write_move(mid, speed * new_len / old_len, width);
            } else {
                sink.write_move(mid, speed, config.line_width);
            }
            *moves += 1;
            p0 = b;
            x += 2;
        }
        sink.write_move(paths[end - 1].points[0], speed, config.line_width);
        *moves += 1;
        Some(end)
    }
}

/// Raise Z by `layer_thickness` in proportion to distance along the path.
fn write_spiralized_path<S: MotionSink + ?Sized>(
    sink: &mut S,
    points: &[Point],
    speed: f64,
    line_width: Coord,
    layer_thickness: Coord,
) -> usize {
    let z = sink.position_z();
    let mut p0 = sink.position_xy();
    let mut total_length = 0.0;
    for &p in points {
        total_length += (p - p0).length_mm();
        p0 = p;
    }

    let mut length = 0.0;
    let mut p0 = sink.position_xy();
    for &p in points {
        length += (p - p0).length_mm();
        p0 = p;
        let fraction = if total_length > 0.0 {
            length / total_length
        } else {
            1.0
        };
        sink.set_z(z + (layer_thickness as f64 * fraction).round() as Coord);
        sink.write_move(p, speed, line_width);
    }
    points.len()
}

/// Write `points`, pushing each corner outward to pre-compensate for the
/// rounding the machine puts on it.
///
/// For every point the nearest path points at least `stretch_distance`
/// before and after it are found; the point is moved `stretch_distance`
/// away from the center of the circle through the three. The line width
/// shrinks by the same ratio the segment grows, so the extruded volume
/// stays the same. Points without neighbours that far away, or on a
/// straight line, are written as they are.
pub fn write_stretched_path<S: MotionSink + ?Sized>(
    sink: &mut S,
    points: &[Point],
    speed: f64,
    line_width: Coord,
    stretch_distance: Coord,
) -> usize {
    let mut all = Vec::with_capacity(points.len() + 1);
    all.push(sink.position_xy());
    all.extend_from_slice(points);

    for i in 1..all.len() {
        let target = all[i];
        let far_enough = |q: &&Point| !(**q - target).shorter_than(stretch_distance);
        let before = all[..i].iter().rev().find(far_enough);
        let after = all[i + 1..].iter().find(far_enough);

        let stretched = before
            .zip(after)
            .and_then(|(&b, &a)| circle_center(b, target, a))
            .and_then(|center| {
                let outward = target.to_vector() - center;
                let len = outward.norm();
                (len > 0.0).then(|| {
                    Point::from_vector(target.to_vector() + outward * (stretch_distance as f64 / len))
                })
            });

        match stretched {
            Some(p) => {
                let from = sink.position_xy();
                let old_len = (target - from).length();
                let new_len = (p - from).length();
                let width = if old_len > 0.0 && new_len > 0.0 {
                    (line_width as f64 * old_len / new_len).round() as Coord
                } else {
                    line_width
                };
                sink.write_move(p, speed, width);
            }
            None => sink.write_move(target, speed, line_width),
        }
    }
    points.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{CommandRecorder, MotionCommand};
    use crate::geometry::Polygon;
    use approx::assert_relative_eq;

    struct Fixture {
        configs: PathConfigs,
        wall: ConfigId,
        fill: ConfigId,
        spiral: ConfigId,
        stretched: ConfigId,
        settings: PlannerSettings,
    }

    fn fixture() -> Fixture {
        let mut configs = PathConfigs::new(PathConfig::travel(150.0));
        let wall = configs.register(PathConfig::extrusion("WALL-OUTER", 50.0, 400));
        let fill = configs.register(PathConfig::extrusion("FILL", 50.0, 400));
        let spiral =
            configs.register(PathConfig::extrusion("WALL-OUTER", 30.0, 400).with_spiralize(true));
        let stretched =
            configs.register(PathConfig::extrusion("WALL-OUTER", 30.0, 400).with_stretch(500));
        Fixture {
            configs,
            wall,
            fill,
            spiral,
            stretched,
            settings: PlannerSettings::default(),
        }
    }

    fn plan(fx: &Fixture) -> LayerPlan<'_> {
        LayerPlan::new(3, Point::default(), 200, &fx.settings, &fx.configs, 0)
    }

    fn square_with_hole() -> Polygons {
        let outer = Polygon::from_mm(&[(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)]);
        let mut hole = Polygon::from_mm(&[(30.0, 30.0), (70.0, 30.0), (70.0, 70.0), (30.0, 70.0)]);
        hole.reverse();
        Polygons::new(vec![outer, hole])
    }

    fn moves(commands: &[MotionCommand]) -> Vec<(Point, Coord, Coord)> {
        commands
            .iter()
            .filter_map(|c| match c {
                MotionCommand::Move {
                    x, y, z, line_width, ..
                } => Some((Point::new(*x, *y), *z, *line_width)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_extrusion_moves_share_path() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(1.0, 0.0), fx.wall);
        plan.add_extrusion_move(Point::from_mm(2.0, 0.0), fx.wall);
        plan.add_extrusion_move(Point::from_mm(3.0, 0.0), fx.fill);
        plan.force_new_path_start();
        plan.add_extrusion_move(Point::from_mm(4.0, 0.0), fx.fill);

        let paths = plan.paths();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].points.len(), 2);
        assert!(paths[1].done);
        assert_eq!(paths[2].config, fx.fill);
        assert_eq!(plan.last_position(), Point::from_mm(4.0, 0.0));
    }

    #[test]
    fn test_unknown_config_is_skipped() {
        let fx = fixture();
        let mut other = fx.configs.clone();
        let foreign = other.register(PathConfig::extrusion("SKIN", 20.0, 400));
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(1.0, 0.0), foreign);
        assert!(plan.paths().is_empty());
        assert_eq!(plan.last_position(), Point::default());
    }

    #[test]
    fn test_set_extruder_opens_new_path() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(1.0, 0.0), fx.wall);
        assert!(!plan.set_extruder(0));
        assert!(plan.set_extruder(1));
        plan.add_extrusion_move(Point::from_mm(2.0, 0.0), fx.wall);

        assert_eq!(plan.paths().len(), 2);
        assert_eq!(plan.paths()[1].extruder, 1);
    }

    #[test]
    fn test_speed_factors_are_floored() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.set_extrude_speed_factor(0.0);
        plan.set_travel_speed_factor(-5.0);
        assert_eq!(plan.extrude_speed_factor(), 1.0);
        assert_eq!(plan.travel_speed_factor(), 1.0);
    }

    #[test]
    fn test_forced_retraction_only_on_long_travel() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.force_retract();
        plan.add_travel(Point::from_mm(1.0, 0.0));
        assert!(!plan.paths()[0].retract);

        // The flag was consumed by the short travel.
        plan.add_extrusion_move(Point::from_mm(2.0, 0.0), fx.wall);
        plan.add_travel(Point::from_mm(50.0, 0.0));
        assert!(!plan.paths()[2].retract);

        plan.force_retract();
        plan.add_extrusion_move(Point::from_mm(51.0, 0.0), fx.wall);
        plan.add_travel(Point::from_mm(90.0, 0.0));
        assert!(plan.paths()[4].retract);
    }

    #[test]
    fn test_always_retract() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.set_always_retract(true);
        plan.add_travel(Point::from_mm(10.0, 0.0));
        assert!(plan.paths()[0].retract);
    }

    #[test]
    fn test_combed_travel_splices_vias() {
        let fx = fixture();
        let boundary = square_with_hole();
        let mut plan = LayerPlan::new(0, Point::from_mm(5.0, 5.0), 200, &fx.settings, &fx.configs, 0);
        plan.set_comb_boundary(Some(&boundary));
        plan.set_always_retract(true);
        plan.add_travel(Point::from_mm(95.0, 95.0));

        let path = &plan.paths()[0];
        assert!(!path.retract);
        assert_eq!(path.points, vec![Point::new(29859, 70141), Point::from_mm(95.0, 95.0)]);
    }

    #[test]
    fn test_travel_past_hole_corner_is_combed() {
        let fx = fixture();
        let boundary = square_with_hole();
        let mut plan = LayerPlan::new(0, Point::from_mm(2.5, 7.5), 200, &fx.settings, &fx.configs, 0);
        plan.set_comb_boundary(Some(&boundary));
        plan.add_travel(Point::from_mm(92.5, 37.5));

        let path = &plan.paths()[0];
        assert!(!path.retract);
        assert_eq!(path.points, vec![Point::from_mm(92.5, 37.5)]);
    }

    #[test]
    fn test_failed_comb_retracts() {
        let fx = fixture();
        let boundary = square_with_hole();
        let mut plan = LayerPlan::new(0, Point::from_mm(5.0, 5.0), 200, &fx.settings, &fx.configs, 0);
        plan.set_comb_boundary(Some(&boundary));
        plan.add_travel(Point::from_mm(150.0, 150.0));

        let path = &plan.paths()[0];
        assert!(path.retract);
        assert_eq!(path.points, vec![Point::from_mm(150.0, 150.0)]);

        plan.set_comb_boundary(None);
        assert!(!plan.has_comb());
    }

    #[test]
    fn test_move_inside_comb_boundary() {
        let fx = fixture();
        let boundary = square_with_hole();

        let mut inside = LayerPlan::new(0, Point::from_mm(5.0, 5.0), 200, &fx.settings, &fx.configs, 0);
        inside.set_comb_boundary(Some(&boundary));
        inside.move_inside_comb_boundary(800);
        assert!(inside.paths().is_empty());

        let mut outside = LayerPlan::new(0, Point::from_mm(50.0, -0.5), 200, &fx.settings, &fx.configs, 0);
        outside.set_comb_boundary(Some(&boundary));
        outside.move_inside_comb_boundary(800);
        assert_eq!(outside.paths().len(), 1);
        assert!(outside.paths()[0].done);
        assert!(boundary.inside(outside.last_position()));
    }

    #[test]
    fn test_add_polygon_closes_loop() {
        let fx = fixture();
        let mut plan = plan(&fx);
        let square = Polygon::from_mm(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        plan.add_polygon(&square.points, 6, fx.wall);

        let paths = plan.paths();
        assert_eq!(paths[0].points, vec![square[2]]);
        assert_eq!(paths[1].points, vec![square[3], square[0], square[1], square[2]]);
    }

    #[test]
    fn test_add_lines_by_optimizer_keeps_lines_open() {
        let fx = fixture();
        let mut plan = plan(&fx);
        let lines = Polygons::new(vec![
            Polygon::from_mm(&[(20.0, 0.0), (10.0, 0.0), (10.0, 5.0)]),
            Polygon::from_mm(&[(0.0, 1.0), (8.0, 1.0)]),
        ]);
        plan.add_lines_by_optimizer(&lines, fx.fill);

        let extrusions: Vec<&GCodePath> = plan.paths().iter().filter(|p| p.config == fx.fill).collect();
        assert_eq!(extrusions.len(), 2);
        assert_eq!(extrusions[0].points, vec![Point::from_mm(8.0, 1.0)]);
        assert_eq!(
            extrusions[1].points,
            vec![Point::from_mm(10.0, 0.0), Point::from_mm(20.0, 0.0)]
        );
    }

    #[test]
    fn test_add_polygons_by_optimizer_visits_all() {
        let fx = fixture();
        let mut plan = plan(&fx);
        let polygons: Polygons = (0..4)
            .map(|i| {
                let x = 30.0 - 10.0 * i as f64;
                Polygon::from_mm(&[(x, 0.0), (x + 2.0, 0.0), (x + 2.0, 2.0), (x, 2.0)])
            })
            .collect();
        plan.add_polygons_by_optimizer(&polygons, fx.wall);

        let walls = plan.paths().iter().filter(|p| p.config == fx.wall).count();
        assert_eq!(walls, 4);
        // Nearest square first.
        assert_eq!(plan.paths()[0].points, vec![Point::from_mm(0.0, 0.0)]);
    }

    #[test]
    fn test_minimal_layer_time_untouched_when_slow_enough() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(100.0, 0.0), fx.wall);
        plan.force_minimal_layer_time(1.0, 10.0);

        assert_eq!(plan.extrude_speed_factor(), 100.0);
        assert_eq!(plan.extra_time(), 0.0);
        assert_relative_eq!(plan.total_print_time(), 2.0);
    }

    #[test]
    fn test_minimal_layer_time_reached() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(100.0, 0.0), fx.wall);
        plan.force_minimal_layer_time(5.0, 10.0);

        assert_relative_eq!(plan.extrude_speed_factor(), 40.0, epsilon = 1e-9);
        assert_relative_eq!(plan.total_print_time(), 5.0, epsilon = 1e-9);
        assert_eq!(plan.extra_time(), 0.0);
    }

    #[test]
    fn test_minimal_layer_time_respects_min_speed() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(100.0, 0.0), fx.wall);
        plan.force_minimal_layer_time(20.0, 10.0);

        assert_relative_eq!(plan.extrude_speed_factor(), 20.0, epsilon = 1e-9);
        assert_relative_eq!(plan.total_print_time(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(plan.extra_time(), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_minimal_layer_time_keeps_stronger_factor() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.set_extrude_speed_factor(30.0);
        plan.add_extrusion_move(Point::from_mm(100.0, 0.0), fx.wall);
        plan.force_minimal_layer_time(5.0, 1.0);

        assert_eq!(plan.extrude_speed_factor(), 30.0);
        assert_relative_eq!(plan.total_print_time(), 2.0 / 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_write_emits_markers_and_retractions() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(10.0, 0.0), fx.wall);
        plan.force_retract();
        plan.add_travel(Point::from_mm(40.0, 0.0));
        plan.add_extrusion_move(Point::from_mm(50.0, 0.0), fx.wall);
        plan.add_extrusion_move(Point::from_mm(50.0, 10.0), fx.fill);
        plan.set_extrude_speed_factor(50.0);

        let mut sink = CommandRecorder::new(&fx.settings);
        let stats = plan.write_gcode(&mut sink, false, 200);

        let markers: Vec<&str> = sink
            .commands()
            .iter()
            .filter_map(|c| match c {
                MotionCommand::FeatureType { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        // Travel in between does not repeat the marker.
        assert_eq!(markers, vec!["WALL-OUTER", "FILL"]);
        assert_eq!(stats.retractions, 1);
        assert_eq!(stats.moves, 4);
        assert!(stats.estimated_time > 0.0);

        let speeds: Vec<f64> = sink
            .commands()
            .iter()
            .filter_map(|c| match c {
                MotionCommand::Move { speed, .. } => Some(*speed),
                _ => None,
            })
            .collect();
        assert_eq!(speeds, vec![25.0, 150.0, 25.0, 25.0]);
    }

    #[test]
    fn test_stats_count_requests() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.force_retract();
        plan.add_travel(Point::from_mm(40.0, 0.0));
        plan.force_new_path_start();
        plan.force_retract();
        plan.add_travel(Point::from_mm(80.0, 0.0));
        plan.add_travel(Point::from_mm(80.0, 0.0));

        let mut sink = CommandRecorder::new(&fx.settings);
        let stats = plan.write_gcode(&mut sink, false, 200);

        assert_eq!(stats.retractions, 2);
        assert_eq!(stats.moves, 3);
        let retracted = sink
            .commands()
            .iter()
            .filter(|c| matches!(c, MotionCommand::Move { retract_before: true, .. }))
            .count();
        assert_eq!(retracted, 1);
        assert_eq!(moves(sink.commands()).len(), 2);
    }

    #[test]
    fn test_write_merges_small_moves() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::new(300, 0), fx.fill);
        plan.add_travel(Point::new(300, 300));
        plan.add_extrusion_move(Point::new(600, 300), fx.fill);
        plan.add_travel(Point::new(600, 600));
        plan.add_extrusion_move(Point::new(900, 600), fx.fill);

        let mut sink = CommandRecorder::new(&fx.settings);
        let stats = plan.write_gcode(&mut sink, false, 200);

        let written = moves(sink.commands());
        assert_eq!(stats.moves, 3);
        assert_eq!(written[0].0, Point::new(300, 150));
        assert_eq!(written[0].2, 358);
        assert_eq!(written[1].0, Point::new(600, 450));
        assert_eq!(written[1].2, 283);
        assert_eq!(written[2].0, Point::new(900, 600));
        assert_eq!(written[2].2, 400);
    }

    #[test]
    fn test_write_spiralizes_last_spiral_path() {
        let fx = fixture();
        let mut plan = plan(&fx);
        let square = Polygon::from_mm(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        plan.add_polygon(&square.points, 0, fx.spiral);

        let mut sink = CommandRecorder::new(&fx.settings);
        plan.write_gcode(&mut sink, false, 200);

        let heights: Vec<Coord> = moves(sink.commands()).iter().map(|m| m.1).collect();
        assert_eq!(heights, vec![200, 250, 300, 350, 400]);
    }

    #[test]
    fn test_write_only_last_spiral_path_rises() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(10.0, 0.0), fx.spiral);
        plan.force_new_path_start();
        plan.add_extrusion_move(Point::from_mm(20.0, 0.0), fx.spiral);

        let mut sink = CommandRecorder::new(&fx.settings);
        plan.write_gcode(&mut sink, false, 200);

        let heights: Vec<Coord> = moves(sink.commands()).iter().map(|m| m.1).collect();
        assert_eq!(heights, vec![200, 400]);
    }

    #[test]
    fn test_write_stretches_corners() {
        let fx = fixture();
        let mut plan = plan(&fx);
        let square = Polygon::from_mm(&[(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]);
        plan.add_polygon(&square.points, 0, fx.stretched);

        let mut sink = CommandRecorder::new(&fx.settings);
        plan.write_gcode(&mut sink, false, 200);

        let written = moves(sink.commands());
        assert_eq!(written.len(), 5);
        assert_eq!(written[1].0, Point::new(10354, -354));
        assert!(written[1].2 < 400);
        assert_eq!(written[2].0, Point::new(10354, 10354));
        assert_eq!(written[3].0, Point::new(-354, 10354));
        // Nothing follows the closing point.
        assert_eq!(written[4].0, Point::new(0, 0));
        assert_eq!(written[4].2, 400);
    }

    #[test]
    fn test_write_lifts_head_for_short_layer() {
        let fx = fixture();
        let mut plan = plan(&fx);
        plan.add_extrusion_move(Point::from_mm(10.0, 0.0), fx.wall);
        plan.force_minimal_layer_time(30.0, 10.0);
        let extra = plan.extra_time();
        assert!(extra > 0.0);

        let mut sink = CommandRecorder::new(&fx.settings);
        let stats = plan.write_gcode(&mut sink, true, 200);

        let commands = sink.commands();
        assert!(commands.contains(&MotionCommand::Comment {
            text: "Small layer, adding delay".into()
        }));
        assert_eq!(commands.last(), Some(&MotionCommand::Dwell { seconds: extra }));
        let written = moves(commands);
        let lifted = written[written.len() - 1];
        assert_eq!(lifted.0, Point::from_mm(30.0, 0.0));
        assert_eq!(lifted.1, 3200);
        assert_eq!(stats.retractions, 1);
    }
}
