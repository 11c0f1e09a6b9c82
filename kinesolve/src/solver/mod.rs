use cgmath::{Quaternion, Vector3};

use crate::structure::{JointIndex, JointSet};

pub mod ccd;
pub mod chain;
pub mod tree;

/// Pose a designated end-effector joint is driven toward. Compared by exact
/// equality when detecting target changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub position: Vector3<f32>,
    pub orientation: Quaternion<f32>,
}

impl Target {
    pub fn new(position: Vector3<f32>, orientation: Quaternion<f32>) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub fn position(&self) -> Vector3<f32> {
        self.position
    }

    pub fn orientation(&self) -> Quaternion<f32> {
        self.orientation
    }
}

/// Host-set solving parameters. Mutable configuration, not solver state.
#[derive(Debug, Clone, Copy)]
pub struct SolverParams {
    /// End-effector distance at which a target counts as reached.
    pub error: f32,
    /// Step change below which an iteration counts as stalled.
    pub min_distance: f32,
    pub max_iterations: usize,
    /// Iterations accumulated per `solve()` call. Values below one spread a
    /// single iteration over several host ticks.
    pub times_per_frame: f32,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            error: 0.01f32,
            min_distance: 0.001f32,
            max_iterations: 50,
            times_per_frame: 5f32,
        }
    }
}

/// Read-only snapshot handed to an iteration watcher.
#[derive(Debug, Clone)]
pub struct IterationEvent {
    pub iteration: usize,
    pub positions: Vec<(JointIndex, Vector3<f32>)>,
}

type Watcher = Box<dyn FnMut(&IterationEvent)>;

/// Lifecycle state shared by every solving strategy.
pub struct SolverState {
    pub params: SolverParams,
    iterations: usize,
    frame_counter: f32,
    force_reset: bool,
    last_error: f32,
    watcher: Option<Watcher>,
}

impl Default for SolverState {
    fn default() -> Self {
        Self {
            params: SolverParams::default(),
            iterations: 0,
            frame_counter: 0f32,
            force_reset: false,
            last_error: f32::MAX,
            watcher: None,
        }
    }
}

impl std::fmt::Debug for SolverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverState")
            .field("params", &self.params)
            .field("iterations", &self.iterations)
            .field("frame_counter", &self.frame_counter)
            .field("force_reset", &self.force_reset)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl SolverState {
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// End-effector distance after the most recent iteration. Diagnostic
    /// only; hosts must not drive behavior from it.
    pub fn last_error(&self) -> f32 {
        self.last_error
    }

    /// Forces working-state rebuild on the next `solve()` call even if the
    /// target has not changed.
    pub fn request_reset(&mut self) {
        self.force_reset = true;
    }

    /// Installs a read-only per-iteration watcher.
    pub fn watch(&mut self, watcher: impl FnMut(&IterationEvent) + 'static) {
        self.watcher = Some(Box::new(watcher));
    }

    pub fn unwatch(&mut self) {
        self.watcher = None;
    }

    pub(crate) fn set_last_error(&mut self, error: f32) {
        self.last_error = error;
    }

    pub(crate) fn restart(&mut self) {
        self.iterations = 0;
        self.frame_counter = 0f32;
        self.force_reset = false;
        self.last_error = f32::MAX;
    }
}

/// One solving strategy driven on a fixed schedule.
///
/// `solve()` is the template: concrete algorithms supply `iterate`,
/// `update`, `changed` and `reset`. A host calls `solve()` once per tick
/// from a single scheduling point; access to one solver instance and its
/// joint set must be serialized by the caller.
pub trait Solve {
    fn state(&self) -> &SolverState;

    fn state_mut(&mut self) -> &mut SolverState;

    /// Joints this solver mutates, for diagnostics snapshots.
    fn solved_joints(&self) -> &[JointIndex];

    /// True when the target pose differs from the cached snapshot.
    fn changed(&self, joints: &JointSet) -> bool;

    /// Rebuilds working state from the live joints and snapshots the
    /// current target.
    fn reset(&mut self, joints: &mut JointSet);

    /// Runs a single iteration step. Returns true exactly when the
    /// end-effector is within `error` of the target or the step's total
    /// change fell to `min_distance` or below.
    fn iterate(&mut self, joints: &mut JointSet) -> bool;

    /// Commits any buffered result not already applied in place.
    fn update(&mut self, joints: &mut JointSet);

    /// Drives the algorithm toward the target, bounded by the per-tick
    /// iteration budget. Returns true once the solver is in its terminal
    /// state (converged, stalled or out of iterations).
    fn solve(&mut self, joints: &mut JointSet) -> bool {
        if self.state().force_reset || self.changed(joints) {
            log::debug!("solver reset: rebuilding working state");
            self.state_mut().restart();
            self.reset(joints);
        }
        let max_iterations = self.state().params.max_iterations;
        if self.state().iterations >= max_iterations {
            return true;
        }
        let mut budget = {
            let state = self.state_mut();
            state.frame_counter += state.params.times_per_frame;
            let whole = state.frame_counter.floor();
            state.frame_counter -= whole;
            whole as usize
        };
        let mut finished = false;
        while budget > 0 && !finished && self.state().iterations < max_iterations {
            finished = self.iterate(joints);
            self.emit(joints);
            if finished {
                log::trace!(
                    "solver finished after {} iterations, residual {}",
                    self.state().iterations,
                    self.state().last_error
                );
                self.state_mut().iterations = max_iterations;
            } else {
                self.state_mut().iterations += 1;
                budget -= 1;
            }
        }
        self.update(joints);
        finished || self.state().iterations >= max_iterations
    }

    /// Publishes an iteration snapshot to the watcher, if one is installed.
    fn emit(&mut self, joints: &JointSet) {
        if self.state().watcher.is_none() {
            return;
        }
        let event = IterationEvent {
            iteration: self.state().iterations,
            positions: self
                .solved_joints()
                .iter()
                .map(|joint| (*joint, joints.position(*joint)))
                .collect(),
        };
        if let Some(watcher) = self.state_mut().watcher.as_mut() {
            watcher(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSolver {
        state: SolverState,
        joints_slice: Vec<JointIndex>,
        steps: usize,
        converge_after: usize,
        pending: bool,
    }

    impl CountingSolver {
        fn new(converge_after: usize) -> Self {
            Self {
                state: SolverState::default(),
                joints_slice: vec![],
                steps: 0,
                converge_after,
                pending: true,
            }
        }
    }

    impl Solve for CountingSolver {
        fn state(&self) -> &SolverState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut SolverState {
            &mut self.state
        }

        fn solved_joints(&self) -> &[JointIndex] {
            &self.joints_slice
        }

        fn changed(&self, _joints: &JointSet) -> bool {
            self.pending
        }

        fn reset(&mut self, _joints: &mut JointSet) {
            self.pending = false;
        }

        fn iterate(&mut self, _joints: &mut JointSet) -> bool {
            self.steps += 1;
            self.steps >= self.converge_after
        }

        fn update(&mut self, _joints: &mut JointSet) {}
    }

    #[test]
    fn test_budget_bounds_iterations_per_tick() {
        let mut joints = JointSet::new();
        let mut solver = CountingSolver::new(usize::MAX);
        solver.state.params.times_per_frame = 2f32;
        solver.state.params.max_iterations = 50;
        assert!(!solver.solve(&mut joints));
        assert_eq!(solver.steps, 2);
        assert_eq!(solver.state.iterations(), 2);
    }

    #[test]
    fn test_fractional_budget_accumulates() {
        let mut joints = JointSet::new();
        let mut solver = CountingSolver::new(usize::MAX);
        solver.state.params.times_per_frame = 0.5f32;
        solver.solve(&mut joints);
        assert_eq!(solver.steps, 0);
        solver.solve(&mut joints);
        assert_eq!(solver.steps, 1);
    }

    #[test]
    fn test_convergence_is_terminal() {
        let mut joints = JointSet::new();
        let mut solver = CountingSolver::new(1);
        solver.state.params.times_per_frame = 5f32;
        assert!(solver.solve(&mut joints));
        assert_eq!(solver.state.iterations(), solver.state.params.max_iterations);
        // terminal until the target changes; no further steps run
        assert!(solver.solve(&mut joints));
        assert_eq!(solver.steps, 1);
    }
}
