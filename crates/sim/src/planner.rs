//! A scripted planner: a queue of fully described moves with the junction
//! speeds a look-ahead planner would have assigned, implementing the
//! [`Planner`] contract the execution core consumes.

use std::collections::VecDeque;

use stepper_core::config::N_AXIS;
use stepper_core::{BlockCondition, Planner, PlannerBlock};
use tracing::debug;

/// Feed rates below this are clamped, mirroring a controller's minimum.
const MINIMUM_FEED_RATE: f32 = 1.0;

/// One scripted move. Speeds are mm/min, acceleration is mm/s² (converted
/// to the core's mm/min² internally).
#[derive(Debug, Clone, Copy)]
pub struct MoveSpec {
    pub steps: [u32; N_AXIS],
    pub direction_bits: u8,
    pub millimeters: f32,
    pub entry_speed: f32,
    /// Junction speed into the following move (zero for a full stop).
    pub exit_speed: f32,
    pub nominal_speed: f32,
    pub accel_mm_s2: f32,
    pub condition: BlockCondition,
    pub spindle_rpm: f32,
}

impl Default for MoveSpec {
    fn default() -> Self {
        Self {
            steps: [0; N_AXIS],
            direction_bits: 0,
            millimeters: 1.0,
            entry_speed: 0.0,
            exit_speed: 0.0,
            nominal_speed: 600.0,
            accel_mm_s2: 100.0,
            condition: BlockCondition::NONE,
            spindle_rpm: 0.0,
        }
    }
}

struct QueuedBlock {
    block: PlannerBlock,
    exit_speed_sqr: f32,
}

fn block_from_spec(spec: &MoveSpec) -> PlannerBlock {
    PlannerBlock {
        steps: spec.steps,
        step_event_count: spec.steps.iter().copied().max().unwrap_or(0),
        direction_bits: spec.direction_bits,
        condition: spec.condition,
        millimeters: spec.millimeters,
        entry_speed_sqr: spec.entry_speed * spec.entry_speed,
        acceleration: spec.accel_mm_s2 * 3600.0,
        programmed_rate: spec.nominal_speed,
        spindle_speed: spec.spindle_rpm,
    }
}

/// Planner stand-in backed by a scripted move queue.
pub struct ScriptedPlanner {
    queue: VecDeque<QueuedBlock>,
    system_block: Option<PlannerBlock>,
    /// Feed override factor applied to nominal speeds (1.0 = 100%).
    /// Blocks flagged [`BlockCondition::NO_FEED_OVERRIDE`] ignore it.
    pub feed_override: f32,
    discarded: usize,
}

impl Default for ScriptedPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            system_block: None,
            feed_override: 1.0,
            discarded: 0,
        }
    }

    pub fn push_move(&mut self, spec: MoveSpec) {
        self.queue.push_back(QueuedBlock {
            block: block_from_spec(&spec),
            exit_speed_sqr: spec.exit_speed * spec.exit_speed,
        });
    }

    /// Stage a homing/parking style motion served outside the program
    /// queue. System motions always run at their programmed rate,
    /// regardless of the feed override.
    pub fn stage_system_motion(&mut self, spec: MoveSpec) {
        let mut block = block_from_spec(&spec);
        block.condition |= BlockCondition::SYSTEM_MOTION | BlockCondition::NO_FEED_OVERRIDE;
        self.system_block = Some(block);
    }

    /// Drop a completed system motion.
    pub fn clear_system_motion(&mut self) {
        self.system_block = None;
    }

    pub fn blocks_discarded(&self) -> usize {
        self.discarded
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Planner for ScriptedPlanner {
    fn current_block(&mut self) -> Option<&mut PlannerBlock> {
        self.queue.front_mut().map(|queued| &mut queued.block)
    }

    fn system_motion_block(&mut self) -> Option<&mut PlannerBlock> {
        self.system_block.as_mut()
    }

    fn discard_current_block(&mut self) {
        if self.queue.pop_front().is_some() {
            self.discarded += 1;
            debug!(discarded = self.discarded, "planner block fully staged");
        }
    }

    fn exec_block_exit_speed_sqr(&mut self) -> f32 {
        self.queue
            .front()
            .map(|queued| queued.exit_speed_sqr)
            .unwrap_or(0.0)
    }

    fn profile_nominal_speed(&self, block: &PlannerBlock) -> f32 {
        let mut nominal = block.programmed_rate;
        if !block.condition.intersects(BlockCondition::NO_FEED_OVERRIDE) {
            nominal *= self.feed_override;
        }
        nominal.max(MINIMUM_FEED_RATE)
    }
}
