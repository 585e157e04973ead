//! Print time estimation with a look-ahead trapezoidal planner.
//!
//! Moves are queued as [`Block`]s. [`TimeEstimateCalculator::calculate`]
//! resolves junction speeds over the whole queue (a reverse pass, a forward
//! pass, then trapezoid recalculation) and sums the time of each
//! accelerate/cruise/decelerate profile. This mirrors what Marlin style
//! firmware does, so the estimate tracks the real machine closely.

use nalgebra::Vector4;

use crate::settings::MachineLimits;

/// Exit speed of the last queued block (mm/s).
pub const MINIMUM_PLANNER_SPEED: f64 = 0.05;

const X_AXIS: usize = 0;
const Y_AXIS: usize = 1;
const Z_AXIS: usize = 2;
const E_AXIS: usize = 3;

/// Machine position in millimeters: X, Y, Z and filament E.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position(pub Vector4<f64>);

impl Position {
    /// Create a position.
    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self(Vector4::new(x, y, z, e))
    }
}

impl Default for Position {
    fn default() -> Self {
        Self(Vector4::zeros())
    }
}

/// One planned move.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Speed entering the block (mm/s).
    pub entry_speed: f64,
    /// Upper bound on the entry speed from the junction with the previous block.
    pub max_entry_speed: f64,
    /// Target cruise speed (mm/s).
    pub nominal_feedrate: f64,
    /// Acceleration limit for this block (mm/s²).
    pub acceleration: f64,
    /// Per-axis displacement (mm).
    pub delta: Vector4<f64>,
    /// Travel distance (mm). XYZ length, or |E| for pure extruder moves.
    pub distance: f64,
    /// Distance spent accelerating.
    pub accelerate_until: f64,
    /// Distance after which deceleration starts.
    pub decelerate_after: f64,
    /// Speed at the start of the profile.
    pub initial_feedrate: f64,
    /// Speed at the end of the profile.
    pub final_feedrate: f64,
    /// The trapezoid must be recomputed.
    pub recalculate: bool,
    /// The block is long enough to reach nominal speed from any entry speed.
    pub nominal_length: bool,
}

impl Block {
    /// Time to traverse the block's profile.
    pub fn duration(&self) -> f64 {
        let plateau = self.decelerate_after - self.accelerate_until;
        acceleration_time_from_distance(self.initial_feedrate, self.accelerate_until, self.acceleration)
            + plateau / self.nominal_feedrate
            + acceleration_time_from_distance(
                self.final_feedrate,
                self.distance - self.decelerate_after,
                self.acceleration,
            )
    }
}

/// Resolved speed at the start of one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Junction {
    /// Entry speed (mm/s).
    pub entry_speed: f64,
    /// Whether the speed changed and the trapezoid needs recomputing.
    pub recalculate: bool,
}

/// Speed profile of one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trapezoid {
    /// Distance spent accelerating.
    pub accelerate_until: f64,
    /// Distance after which deceleration starts.
    pub decelerate_after: f64,
    /// Speed at the start.
    pub initial_feedrate: f64,
    /// Speed at the end.
    pub final_feedrate: f64,
}

/// Look-ahead time estimator.
#[derive(Debug, Clone)]
pub struct TimeEstimateCalculator {
    max_feedrate: Vector4<f64>,
    max_acceleration: Vector4<f64>,
    minimum_feedrate: f64,
    acceleration: f64,
    max_xy_jerk: f64,
    max_z_jerk: f64,
    max_e_jerk: f64,
    extra_time: f64,
    previous_feedrate: Vector4<f64>,
    previous_nominal_feedrate: f64,
    position: Position,
    blocks: Vec<Block>,
}

impl Default for TimeEstimateCalculator {
    fn default() -> Self {
        Self::with_limits(&MachineLimits::generic())
    }
}

impl TimeEstimateCalculator {
    /// Create an estimator using the given firmware limits.
    pub fn with_limits(limits: &MachineLimits) -> Self {
        Self {
            max_feedrate: Vector4::from(limits.max_feedrate),
            max_acceleration: Vector4::from(limits.max_acceleration),
            minimum_feedrate: limits.minimum_feedrate,
            acceleration: limits.acceleration,
            max_xy_jerk: limits.max_xy_jerk,
            max_z_jerk: limits.max_z_jerk,
            max_e_jerk: limits.max_e_jerk,
            extra_time: 0.0,
            previous_feedrate: Vector4::zeros(),
            previous_nominal_feedrate: 0.0,
            position: Position::default(),
            blocks: Vec::new(),
        }
    }

    /// Jump to a position without planning a move.
    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// Current planned position.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Add a fixed amount of time (dwell, tool change, ...).
    pub fn add_time(&mut self, seconds: f64) {
        self.extra_time += seconds;
    }

    /// Set the default acceleration.
    pub fn set_acceleration(&mut self, acceleration: f64) {
        self.acceleration = acceleration;
    }

    /// Set the maximum XY jerk.
    pub fn set_max_xy_jerk(&mut self, jerk: f64) {
        self.max_xy_jerk = jerk;
    }

    /// Queued blocks.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Drop all queued blocks and extra time. The position is kept.
    pub fn reset(&mut self) {
        self.extra_time = 0.0;
        self.blocks.clear();
    }

    /// Queue a move to `target` at `feedrate` mm/s.
    ///
    /// Moves that go nowhere on any axis are dropped.
    pub fn plan(&mut self, target: Position, feedrate: f64) {
        let delta = target.0 - self.position.0;
        let abs_delta = delta.abs();
        if abs_delta.max() <= 0.0 {
            return;
        }

        let feedrate = feedrate.max(self.minimum_feedrate);
        let mut distance = delta.xyz().norm();
        if distance == 0.0 {
            distance = abs_delta[E_AXIS];
        }

        let mut current_feedrate = delta * (feedrate / distance);
        let mut feedrate_factor: f64 = 1.0;
        for axis in 0..4 {
            let speed = current_feedrate[axis].abs();
            if speed > self.max_feedrate[axis] {
                feedrate_factor = feedrate_factor.min(self.max_feedrate[axis] / speed);
            }
        }
        let mut nominal_feedrate = feedrate;
        if feedrate_factor < 1.0 {
            current_feedrate *= feedrate_factor;
            nominal_feedrate *= feedrate_factor;
        }

        let mut acceleration = self.acceleration;
        for axis in 0..4 {
            if acceleration * (abs_delta[axis] / distance) > self.max_acceleration[axis] {
                acceleration = self.max_acceleration[axis];
            }
        }

        let mut vmax_junction = self.max_xy_jerk / 2.0;
        if current_feedrate[Z_AXIS].abs() > self.max_z_jerk / 2.0 {
            vmax_junction = vmax_junction.min(self.max_z_jerk / 2.0);
        }
        if current_feedrate[E_AXIS].abs() > self.max_e_jerk / 2.0 {
            vmax_junction = vmax_junction.min(self.max_e_jerk / 2.0);
        }
        vmax_junction = vmax_junction.min(nominal_feedrate);
        let safe_speed = vmax_junction;

        if !self.blocks.is_empty() && self.previous_nominal_feedrate > 0.0001 {
            let change = current_feedrate - self.previous_feedrate;
            let xy_jerk = change[X_AXIS].hypot(change[Y_AXIS]);
            let mut factor: f64 = 1.0;
            if xy_jerk > self.max_xy_jerk {
                factor = self.max_xy_jerk / xy_jerk;
            }
            if change[Z_AXIS].abs() > self.max_z_jerk {
                factor = factor.min(self.max_z_jerk / change[Z_AXIS].abs());
            }
            if change[E_AXIS].abs() > self.max_e_jerk {
                factor = factor.min(self.max_e_jerk / change[E_AXIS].abs());
            }
            vmax_junction = self.previous_nominal_feedrate.min(nominal_feedrate * factor);
        }

        let v_allowable = max_allowable_speed(-acceleration, MINIMUM_PLANNER_SPEED, distance);
        let entry_speed = vmax_junction.min(v_allowable);

        let mut block = Block {
            entry_speed,
            max_entry_speed: vmax_junction,
            nominal_feedrate,
            acceleration,
            delta,
            distance,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            initial_feedrate: 0.0,
            final_feedrate: 0.0,
            recalculate: true,
            nominal_length: nominal_feedrate <= v_allowable,
        };
        let trapezoid = trapezoid_for_block(
            &block,
            entry_speed / nominal_feedrate,
            safe_speed / nominal_feedrate,
        );
        apply_trapezoid(&mut block, trapezoid);

        self.previous_feedrate = current_feedrate;
        self.previous_nominal_feedrate = nominal_feedrate;
        self.position = target;
        self.blocks.push(block);
    }

    /// Resolve the queued blocks and return the total time in seconds,
    /// including any added time.
    pub fn calculate(&mut self) -> f64 {
        let junctions = reverse_pass(&self.blocks);
        let junctions = forward_pass(&self.blocks, junctions);
        let trapezoids = recalculate_trapezoids(&self.blocks, &junctions);

        for ((block, junction), trapezoid) in self.blocks.iter_mut().zip(&junctions).zip(trapezoids) {
            block.entry_speed = junction.entry_speed;
            block.recalculate = false;
            apply_trapezoid(block, trapezoid);
        }

        self.extra_time + self.blocks.iter().map(Block::duration).sum::<f64>()
    }
}

/// Walk the queue tail to head, raising each entry speed as far as the
/// following block can still brake down to its own entry speed.
///
/// The first and last blocks keep their planned entry speeds.
pub fn reverse_pass(blocks: &[Block]) -> Vec<Junction> {
    let mut junctions: Vec<Junction> = blocks
        .iter()
        .map(|b| Junction {
            entry_speed: b.entry_speed,
            recalculate: b.recalculate,
        })
        .collect();

    if blocks.len() < 3 {
        return junctions;
    }

    for i in (1..blocks.len() - 1).rev() {
        let current = &blocks[i];
        let next_entry = junctions[i + 1].entry_speed;
        if junctions[i].entry_speed != current.max_entry_speed {
            junctions[i].entry_speed =
                if !current.nominal_length && current.max_entry_speed > next_entry {
                    current.max_entry_speed.min(max_allowable_speed(
                        -current.acceleration,
                        next_entry,
                        current.distance,
                    ))
                } else {
                    current.max_entry_speed
                };
            junctions[i].recalculate = true;
        }
    }
    junctions
}

/// Walk the queue head to tail, capping each entry speed by what the
/// previous block can reach when accelerating over its own length.
pub fn forward_pass(blocks: &[Block], mut junctions: Vec<Junction>) -> Vec<Junction> {
    for i in 1..blocks.len() {
        let previous = &blocks[i - 1];
        if previous.nominal_length {
            continue;
        }
        let previous_entry = junctions[i - 1].entry_speed;
        let current_entry = junctions[i].entry_speed;
        if previous_entry < current_entry {
            let entry_speed = current_entry.min(max_allowable_speed(
                -previous.acceleration,
                previous_entry,
                previous.distance,
            ));
            if entry_speed != current_entry {
                junctions[i].entry_speed = entry_speed;
                junctions[i].recalculate = true;
            }
        }
    }
    junctions
}

/// Speed profiles implied by the resolved junctions.
///
/// A block is recomputed when its own entry or the next block's entry
/// changed. The last block always ends at [`MINIMUM_PLANNER_SPEED`].
pub fn recalculate_trapezoids(blocks: &[Block], junctions: &[Junction]) -> Vec<Trapezoid> {
    let mut trapezoids: Vec<Trapezoid> = blocks.iter().map(current_trapezoid).collect();
    let Some(last) = blocks.len().checked_sub(1) else {
        return trapezoids;
    };

    for i in 0..last {
        if junctions[i].recalculate || junctions[i + 1].recalculate {
            let block = &blocks[i];
            trapezoids[i] = trapezoid_for_block(
                block,
                junctions[i].entry_speed / block.nominal_feedrate,
                junctions[i + 1].entry_speed / block.nominal_feedrate,
            );
        }
    }

    let block = &blocks[last];
    trapezoids[last] = trapezoid_for_block(
        block,
        junctions[last].entry_speed / block.nominal_feedrate,
        MINIMUM_PLANNER_SPEED / block.nominal_feedrate,
    );
    trapezoids
}

fn current_trapezoid(block: &Block) -> Trapezoid {
    Trapezoid {
        accelerate_until: block.accelerate_until,
        decelerate_after: block.decelerate_after,
        initial_feedrate: block.initial_feedrate,
        final_feedrate: block.final_feedrate,
    }
}

fn apply_trapezoid(block: &mut Block, trapezoid: Trapezoid) {
    block.accelerate_until = trapezoid.accelerate_until;
    block.decelerate_after = trapezoid.decelerate_after;
    block.initial_feedrate = trapezoid.initial_feedrate;
    block.final_feedrate = trapezoid.final_feedrate;
}

/// Profile for `block` entering and leaving at the given fractions of its
/// nominal feedrate.
fn trapezoid_for_block(block: &Block, entry_factor: f64, exit_factor: f64) -> Trapezoid {
    let initial_feedrate = block.nominal_feedrate * entry_factor;
    let final_feedrate = block.nominal_feedrate * exit_factor;
    let acceleration = block.acceleration;

    let mut accelerate_distance =
        estimate_acceleration_distance(initial_feedrate, block.nominal_feedrate, acceleration);
    let decelerate_distance =
        estimate_acceleration_distance(block.nominal_feedrate, final_feedrate, -acceleration);
    let mut plateau_distance = block.distance - accelerate_distance - decelerate_distance;

    // No cruise phase: brake where the accel and decel curves meet.
    if plateau_distance < 0.0 {
        accelerate_distance =
            intersection_distance(initial_feedrate, final_feedrate, acceleration, block.distance)
                .clamp(0.0, block.distance);
        plateau_distance = 0.0;
    }

    Trapezoid {
        accelerate_until: accelerate_distance,
        decelerate_after: accelerate_distance + plateau_distance,
        initial_feedrate,
        final_feedrate,
    }
}

/// Highest speed from which `target_velocity` is still reachable within
/// `distance`. Pass a negative acceleration for braking.
fn max_allowable_speed(acceleration: f64, target_velocity: f64, distance: f64) -> f64 {
    (target_velocity * target_velocity - 2.0 * acceleration * distance)
        .max(0.0)
        .sqrt()
}

fn estimate_acceleration_distance(initial_rate: f64, target_rate: f64, acceleration: f64) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target_rate * target_rate - initial_rate * initial_rate) / (2.0 * acceleration)
}

fn intersection_distance(
    initial_rate: f64,
    final_rate: f64,
    acceleration: f64,
    distance: f64,
) -> f64 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial_rate * initial_rate + final_rate * final_rate)
        / (4.0 * acceleration)
}

fn acceleration_time_from_distance(initial_feedrate: f64, distance: f64, acceleration: f64) -> f64 {
    if acceleration == 0.0 {
        return if initial_feedrate > 0.0 {
            distance / initial_feedrate
        } else {
            0.0
        };
    }
    // Negative means the parabola never reaches the distance; use its extremum.
    let discriminant = (initial_feedrate * initial_feedrate + 2.0 * acceleration * distance).max(0.0);
    (-initial_feedrate + discriminant.sqrt()) / acceleration
}
