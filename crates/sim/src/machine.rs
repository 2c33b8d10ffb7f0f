//! The simulated machine: wires a scripted planner, the segment preparer,
//! the step execution engine, and trace hardware into one harness that
//! tests drive tick by tick.
//!
//! Time is counted in stepper-timer cycles. Each [`SimMachine::tick`] is
//! one invocation of the step interrupt followed by its pulse reset, with
//! the simulated clock advanced by the timer reload the engine programmed.
//! The foreground preparer is pumped between interrupts, mirroring the
//! firmware's main loop.

use stepper_core::segment::SegmentBuffer;
use stepper_core::system::{MachineState, STEP_CONTROL_EXECUTE_HOLD, STEP_CONTROL_EXECUTE_SYS_MOTION};
use stepper_core::{MotionHardware, SegmentPreparer, Segment, Settings, StepExecutor, SystemState};
use tracing::{debug, info, instrument};

use crate::error::SimError;
use crate::hw::{PortEvent, TraceDelay, TraceEnable, TracePort, TraceProbe, TraceSpindle, TraceTimer};
use crate::planner::ScriptedPlanner;
use crate::trace::PulseRecord;

pub type SimHardware =
    MotionHardware<TracePort, TraceTimer, TraceSpindle, TraceProbe, TraceEnable, TraceDelay>;

pub struct SimMachine {
    pub system: SystemState,
    pub settings: Settings,
    pub planner: ScriptedPlanner,
    pub hw: SimHardware,
    preparer: SegmentPreparer<'static>,
    executor: StepExecutor<'static>,
    /// Simulated time, in stepper-timer cycles.
    pub clock_cycles: u64,
    pub ticks: u64,
    /// Decoded step pulses (non-idle step writes), in emission order.
    pub pulses: Vec<PulseRecord>,
    /// Every segment the engine loaded, in execution order.
    pub segments_seen: Vec<Segment>,
    decoded_events: usize,
    seen_reloads: usize,
    dir_bits_now: u8,
    probe_hold_issued: bool,
}

impl SimMachine {
    pub fn new(settings: Settings, planner: ScriptedPlanner) -> Self {
        // The ring is borrowed by both halves for the life of the machine;
        // leaking one buffer per harness mirrors the firmware's static
        // allocation and keeps the handles `'static`.
        let buffer: &'static mut SegmentBuffer = Box::leak(Box::new(SegmentBuffer::new()));
        let (producer, consumer) = buffer.split();
        let executor = StepExecutor::new(consumer, &settings);
        Self {
            system: SystemState::new(),
            settings,
            planner,
            hw: SimHardware {
                step_port: TracePort::default(),
                timer: TraceTimer::default(),
                spindle: TraceSpindle::default(),
                probe: TraceProbe::default(),
                enable: TraceEnable::default(),
                delay: TraceDelay::default(),
            },
            preparer: SegmentPreparer::new(producer),
            executor,
            clock_cycles: 0,
            ticks: 0,
            pulses: Vec::new(),
            segments_seen: Vec::new(),
            decoded_events: 0,
            seen_reloads: 0,
            dir_bits_now: 0,
            probe_hold_issued: false,
        }
    }

    /// Run one pass of the foreground segment preparer.
    pub fn pump(&mut self) {
        self.preparer
            .prepare_buffer(&mut self.planner, &self.hw.spindle, &self.settings, &self.system);
    }

    /// Enter the cycle: fill the ring, energize the drivers, start the
    /// timer.
    pub fn start_cycle(&mut self) {
        info!("cycle start");
        self.system.set_state(MachineState::Cycle);
        self.pump();
        self.executor.wake_up(&mut self.hw, &self.settings);
    }

    /// One step interrupt plus its trailing pulse reset.
    pub fn tick(&mut self) {
        self.hw.step_port.now_cycles = self.clock_cycles;
        self.executor
            .on_timer_tick(&mut self.hw, &self.settings, &self.system);
        self.ticks += 1;

        self.decode_new_events();
        self.record_loaded_segment();

        // The probe monitor latches its trip; the harness owns the hold
        // reaction, as the realtime protocol layer would in firmware.
        if self.hw.probe.tripped && !self.probe_hold_issued {
            self.probe_hold_issued = true;
            debug!("probe trip observed, issuing feed hold");
            self.feed_hold();
        }

        let reload = self.hw.timer.reloads.last().copied().unwrap_or(1_000);
        self.clock_cycles += u64::from(reload);
        self.executor.on_pulse_reset(&mut self.hw.step_port);
        self.decode_new_events();
    }

    /// Pump-and-tick until the engine signals the cycle end.
    #[instrument(skip(self))]
    pub fn run_until_stop(&mut self, max_ticks: u64) -> Result<(), SimError> {
        for _ in 0..max_ticks {
            self.pump();
            self.tick();
            if self.system.take_cycle_stop() {
                info!(ticks = self.ticks, pulses = self.pulses.len(), "cycle stop");
                return Ok(());
            }
        }
        Err(SimError::Timeout { ticks: max_ticks })
    }

    /// Pump-and-tick until `axis` has emitted `count` pulses.
    pub fn run_until_axis_pulses(
        &mut self,
        axis: usize,
        count: u32,
        max_ticks: u64,
    ) -> Result<(), SimError> {
        for _ in 0..max_ticks {
            if self.axis_pulse_count(axis) >= count {
                return Ok(());
            }
            self.pump();
            self.tick();
            if self.system.take_cycle_stop() {
                return Err(SimError::UnexpectedStop);
            }
        }
        Err(SimError::Timeout { ticks: max_ticks })
    }

    /// Initiate a feed hold, the way the realtime protocol would: hand the
    /// preparer the reached speed, then flag the forced deceleration.
    pub fn feed_hold(&mut self) {
        self.preparer
            .update_block_parameters(&mut self.planner, &self.system);
        self.system
            .set_step_control_flags(STEP_CONTROL_EXECUTE_HOLD);
        self.system.set_state(MachineState::Hold);
    }

    /// Resume from a completed hold: re-plan from standstill and restart
    /// the cycle.
    pub fn resume(&mut self) {
        self.preparer
            .update_block_parameters(&mut self.planner, &self.system);
        self.system.reset_step_control();
        self.system.set_state(MachineState::Cycle);
        self.pump();
        self.executor.wake_up(&mut self.hw, &self.settings);
    }

    /// Simulate a look-ahead re-plan touching the active block.
    pub fn plan_update(&mut self) {
        self.preparer
            .update_block_parameters(&mut self.planner, &self.system);
    }

    /// Begin a parking interlude after a completed hold: snapshot the
    /// partial block, stage the retract as a system motion, and run it.
    pub fn begin_parking(&mut self, retract: crate::MoveSpec) {
        self.system.set_state(MachineState::SafetyDoor);
        self.preparer.parking_setup_buffer();
        self.planner.stage_system_motion(retract);
        self.system.clear_step_control_flags(
            stepper_core::system::STEP_CONTROL_END_MOTION | STEP_CONTROL_EXECUTE_HOLD,
        );
        self.system
            .set_step_control_flags(STEP_CONTROL_EXECUTE_SYS_MOTION);
        self.pump();
        self.executor.wake_up(&mut self.hw, &self.settings);
    }

    /// End the parking interlude: restore the partial block and resume the
    /// interrupted program.
    pub fn end_parking(&mut self) {
        self.planner.clear_system_motion();
        self.preparer.parking_restore_buffer();
        self.system.reset_step_control();
        self.system.set_state(MachineState::Cycle);
        self.pump();
        self.executor.wake_up(&mut self.hw, &self.settings);
    }

    /// Begin a system motion (homing/parking move staged on the planner).
    pub fn start_system_motion(&mut self, state: MachineState) {
        self.system.set_state(state);
        self.system
            .set_step_control_flags(STEP_CONTROL_EXECUTE_SYS_MOTION);
        self.pump();
        self.executor.wake_up(&mut self.hw, &self.settings);
    }

    pub fn realtime_rate(&self) -> f32 {
        self.preparer.realtime_rate(&self.system)
    }

    pub fn has_partial_block(&self) -> bool {
        self.preparer.has_partial_block()
    }

    pub fn axis_pulse_count(&self, axis: usize) -> u32 {
        self.pulses
            .iter()
            .filter(|pulse| pulse.step_bits & (1 << axis) != 0)
            .count() as u32
    }

    fn decode_new_events(&mut self) {
        // Polarity masks are zero in the harness settings, so raw port bits
        // are the logical pulse bits.
        for index in self.decoded_events..self.hw.step_port.events.len() {
            match self.hw.step_port.events[index] {
                PortEvent::Dir { bits, .. } => self.dir_bits_now = bits,
                PortEvent::Step { t_cycles, bits } => {
                    if bits != 0 {
                        self.pulses.push(PulseRecord {
                            t_cycles,
                            step_bits: bits,
                            dir_bits: self.dir_bits_now,
                        });
                    }
                }
            }
        }
        self.decoded_events = self.hw.step_port.events.len();
    }

    fn record_loaded_segment(&mut self) {
        // The engine programs the timer exactly once per segment load, so a
        // new reload entry means a segment was just bound.
        if self.hw.timer.reloads.len() > self.seen_reloads {
            self.seen_reloads = self.hw.timer.reloads.len();
            if let Some(segment) = self.executor.current_segment() {
                self.segments_seen.push(segment);
            }
        }
    }
}
