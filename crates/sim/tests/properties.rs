//! Invariant tests: step conservation, smoothing exactness, direction
//! monotonicity, backlash suppression, plan-update idempotence, laser PWM
//! coupling, probe polling, and system motions.

use sim::{init_test_logging, MoveSpec, ScriptedPlanner, SimMachine};
use stepper_core::config::{X_AXIS, Y_AXIS, Z_AXIS};
use stepper_core::planner::BlockCondition;
use stepper_core::settings::SETTINGS_FLAG_LASER_MODE;
use stepper_core::system::MachineState;
use stepper_core::Settings;

fn machine_with(moves: Vec<MoveSpec>) -> SimMachine {
    init_test_logging();
    let mut planner = ScriptedPlanner::new();
    for spec in moves {
        planner.push_move(spec);
    }
    SimMachine::new(Settings::new(), planner)
}

/// Per-axis pulse totals across a chained multi-block program equal the
/// commanded counts exactly, and positions carry the commanded signs.
#[test]
fn step_conservation_across_chained_blocks() {
    let moves = vec![
        MoveSpec {
            steps: [400, 300, 0],
            millimeters: 5.0,
            nominal_speed: 3000.0,
            accel_mm_s2: 400.0,
            exit_speed: 1200.0,
            ..MoveSpec::default()
        },
        MoveSpec {
            steps: [250, 250, 250],
            direction_bits: 0b010, // Y negative
            millimeters: 4.33,
            entry_speed: 1200.0,
            nominal_speed: 2400.0,
            accel_mm_s2: 400.0,
            ..MoveSpec::default()
        },
        MoveSpec {
            steps: [0, 0, 77],
            millimeters: 0.77,
            nominal_speed: 600.0,
            accel_mm_s2: 100.0,
            ..MoveSpec::default()
        },
    ];
    let mut machine = machine_with(moves);

    machine.start_cycle();
    machine.run_until_stop(2_000_000).unwrap();

    assert_eq!(machine.axis_pulse_count(X_AXIS), 400 + 250);
    assert_eq!(machine.axis_pulse_count(Y_AXIS), 300 + 250);
    assert_eq!(machine.axis_pulse_count(Z_AXIS), 250 + 77);
    assert_eq!(machine.system.position(X_AXIS), 650);
    assert_eq!(machine.system.position(Y_AXIS), 300 - 250);
    assert_eq!(machine.system.position(Z_AXIS), 327);
    assert_eq!(machine.planner.blocks_discarded(), 3);
    assert!(machine.planner.is_drained());
}

/// The same geometry run at wildly different speeds selects different
/// smoothing levels but emits identical per-axis totals.
#[test]
fn smoothing_exactness_is_speed_independent() {
    let mut totals = Vec::new();
    let mut level_sets = Vec::new();
    for nominal in [6000.0, 600.0, 60.0] {
        let mut machine = machine_with(vec![MoveSpec {
            steps: [500, 140, 9],
            millimeters: 5.0,
            nominal_speed: nominal,
            accel_mm_s2: 500.0,
            ..MoveSpec::default()
        }]);
        machine.start_cycle();
        machine.run_until_stop(4_000_000).unwrap();
        totals.push([
            machine.axis_pulse_count(X_AXIS),
            machine.axis_pulse_count(Y_AXIS),
            machine.axis_pulse_count(Z_AXIS),
        ]);
        let levels: std::collections::BTreeSet<u8> = machine
            .segments_seen
            .iter()
            .map(|segment| segment.amass_level)
            .collect();
        level_sets.push(levels);
    }
    for total in &totals {
        assert_eq!(total, &[500, 140, 9]);
    }
    // The speed spread actually exercised different levels.
    assert_ne!(level_sets[0], level_sets[2]);
}

/// Within a block, the position counter only ever moves in the commanded
/// direction.
#[test]
fn position_moves_monotonically_per_block() {
    let mut machine = machine_with(vec![MoveSpec {
        steps: [300, 0, 0],
        direction_bits: 0b001,
        millimeters: 3.0,
        nominal_speed: 1200.0,
        accel_mm_s2: 300.0,
        ..MoveSpec::default()
    }]);
    machine.start_cycle();

    let mut last = machine.system.position(X_AXIS);
    for _ in 0..1_000_000 {
        machine.pump();
        machine.tick();
        let now = machine.system.position(X_AXIS);
        assert!(now <= last, "negative block moved backward: {last} -> {now}");
        last = now;
        if machine.system.take_cycle_stop() {
            break;
        }
    }
    assert_eq!(last, -300);
}

/// Backlash compensation emits pulses but freezes the position counters.
#[test]
fn backlash_pulses_do_not_move_position() {
    let mut machine = machine_with(vec![
        MoveSpec {
            steps: [40, 0, 0],
            millimeters: 0.4,
            nominal_speed: 600.0,
            accel_mm_s2: 200.0,
            condition: BlockCondition::BACKLASH_COMP,
            ..MoveSpec::default()
        },
        MoveSpec {
            steps: [100, 0, 0],
            millimeters: 1.0,
            nominal_speed: 600.0,
            accel_mm_s2: 200.0,
            ..MoveSpec::default()
        },
    ]);
    machine.start_cycle();
    machine.run_until_stop(2_000_000).unwrap();

    assert_eq!(machine.axis_pulse_count(X_AXIS), 140);
    // Only the real motion lands in the position counter.
    assert_eq!(machine.system.position(X_AXIS), 100);
}

/// Re-planning the active block mid-flight (same plan) neither loses nor
/// duplicates steps.
#[test]
fn plan_update_is_idempotent_on_step_totals() {
    let mut machine = machine_with(vec![MoveSpec {
        steps: [1500, 0, 0],
        millimeters: 15.0,
        nominal_speed: 4800.0,
        accel_mm_s2: 500.0,
        ..MoveSpec::default()
    }]);
    machine.start_cycle();

    for checkpoint in [200, 500, 900] {
        machine
            .run_until_axis_pulses(X_AXIS, checkpoint, 2_000_000)
            .unwrap();
        machine.plan_update();
    }
    machine.run_until_stop(2_000_000).unwrap();

    assert_eq!(machine.axis_pulse_count(X_AXIS), 1500);
    assert_eq!(machine.system.position(X_AXIS), 1500);
}

/// Laser mode with a CCW spindle block: PWM rises and falls with the feed
/// rate over a trapezoid and switches off when the ring drains.
#[test]
fn laser_pwm_follows_the_feed_rate() {
    init_test_logging();
    let mut planner = ScriptedPlanner::new();
    planner.push_move(MoveSpec {
        steps: [2000, 0, 0],
        millimeters: 20.0,
        nominal_speed: 6000.0,
        accel_mm_s2: 600.0,
        condition: BlockCondition::SPINDLE_CCW,
        spindle_rpm: 8000.0,
        ..MoveSpec::default()
    });
    let mut settings = Settings::new();
    settings.flags |= SETTINGS_FLAG_LASER_MODE;
    let mut machine = SimMachine::new(settings, planner);

    machine.start_cycle();
    machine.run_until_stop(2_000_000).unwrap();

    let history = &machine.hw.spindle.history;
    assert!(history.len() >= 3, "PWM never tracked the ramp: {history:?}");
    let peak = *history.iter().max().unwrap();
    let first = *history.iter().find(|&&pwm| pwm > 0).unwrap();
    assert!(peak > first, "PWM did not rise with the feed rate");
    // Drain shutdown forces the rate-adjusted spindle off.
    assert_eq!(*history.last().unwrap(), 0);
    assert_eq!(machine.hw.spindle.duty, 0);
}

/// The probe monitor is polled from the tick path while armed, and its
/// trip leads to a feed hold that stops motion short of the full block.
#[test]
fn probe_poll_can_stop_the_cycle() {
    let mut machine = machine_with(vec![MoveSpec {
        steps: [2000, 0, 0],
        millimeters: 20.0,
        nominal_speed: 3000.0,
        accel_mm_s2: 600.0,
        ..MoveSpec::default()
    }]);
    machine.system.set_probe_active(true);
    machine.hw.probe.trip_after_polls = Some(40);

    machine.start_cycle();
    machine.run_until_stop(2_000_000).unwrap();

    assert!(machine.hw.probe.tripped);
    assert!(machine.hw.probe.polls >= 40);
    let emitted = machine.axis_pulse_count(X_AXIS);
    assert!(emitted < 2000, "probe hold did not shorten the move");
    assert_eq!(machine.system.position(X_AXIS) as u32, emitted);
}

/// A homing-style system motion: only the locked-in axis is allowed to
/// pulse, and finishing the motion latches the end-of-motion state.
#[test]
fn system_motion_respects_the_homing_axis_lock() {
    init_test_logging();
    let mut planner = ScriptedPlanner::new();
    planner.stage_system_motion(MoveSpec {
        steps: [64, 64, 0],
        millimeters: 1.0,
        nominal_speed: 600.0,
        accel_mm_s2: 200.0,
        ..MoveSpec::default()
    });
    let mut machine = SimMachine::new(Settings::new(), planner);
    machine.system.set_homing_axis_lock(1 << Y_AXIS);

    machine.start_system_motion(MachineState::Homing);
    machine.run_until_stop(2_000_000).unwrap();

    assert_eq!(machine.axis_pulse_count(X_AXIS), 0);
    assert_eq!(machine.axis_pulse_count(Y_AXIS), 64);
    use stepper_core::system::STEP_CONTROL_END_MOTION;
    assert!(machine.system.step_control() & STEP_CONTROL_END_MOTION != 0);
    // Bresenham still tracked both axes; the lock only gates the outputs.
    assert_eq!(machine.system.position(X_AXIS), 64);
}

/// The feed override scales ordinary feed moves but leaves rapids and
/// other override-exempt blocks at their programmed rate.
#[test]
fn feed_override_skips_no_override_blocks() {
    init_test_logging();
    let spec = MoveSpec {
        steps: [1000, 0, 0],
        millimeters: 10.0,
        nominal_speed: 6000.0,
        accel_mm_s2: 600.0,
        ..MoveSpec::default()
    };

    let run = |condition: BlockCondition, feed_override: f32| {
        let mut move_spec = spec;
        move_spec.condition = condition;
        let mut planner = ScriptedPlanner::new();
        planner.push_move(move_spec);
        planner.feed_override = feed_override;
        let mut machine = SimMachine::new(Settings::new(), planner);
        machine.start_cycle();
        machine.run_until_stop(2_000_000).unwrap();
        assert_eq!(machine.axis_pulse_count(X_AXIS), 1000);
        machine.clock_cycles
    };

    let baseline = run(BlockCondition::NONE, 1.0);
    let overridden = run(BlockCondition::NONE, 0.25);
    let exempt = run(BlockCondition::NO_FEED_OVERRIDE, 0.25);

    // Quarter feed takes markedly longer; the exempt block does not.
    assert!(
        overridden as f64 > baseline as f64 * 1.5,
        "override had no effect: {baseline} vs {overridden}"
    );
    assert!(
        (exempt as f64) < baseline as f64 * 1.1,
        "override leaked into an exempt block: {baseline} vs {exempt}"
    );
}

/// A parking interlude after a hold: the retract runs as a system motion,
/// the partial block is snapshotted and restored, and the resumed program
/// still emits its exact step total.
#[test]
fn parking_interlude_preserves_the_partial_block() {
    let mut machine = machine_with(vec![MoveSpec {
        steps: [2000, 0, 0],
        millimeters: 20.0,
        nominal_speed: 6000.0,
        accel_mm_s2: 600.0,
        ..MoveSpec::default()
    }]);

    machine.start_cycle();
    machine.run_until_axis_pulses(X_AXIS, 500, 2_000_000).unwrap();
    machine.feed_hold();
    machine.run_until_stop(2_000_000).unwrap();
    assert!(machine.has_partial_block());

    // Retract Z while the program block is parked.
    machine.begin_parking(MoveSpec {
        steps: [0, 0, 200],
        millimeters: 2.0,
        nominal_speed: 1200.0,
        accel_mm_s2: 300.0,
        ..MoveSpec::default()
    });
    machine.run_until_stop(2_000_000).unwrap();
    assert_eq!(machine.axis_pulse_count(Z_AXIS), 200);

    machine.end_parking();
    machine.run_until_stop(2_000_000).unwrap();
    assert_eq!(machine.axis_pulse_count(X_AXIS), 2000);
    assert_eq!(machine.system.position(X_AXIS), 2000);
    // The retract was the only Z motion.
    assert_eq!(machine.axis_pulse_count(Z_AXIS), 200);
}

/// A captured pulse trace survives the JSON dump/load round trip intact.
#[test]
fn pulse_trace_round_trips_through_json() {
    let mut machine = machine_with(vec![MoveSpec {
        steps: [120, 40, 0],
        millimeters: 1.2,
        nominal_speed: 1200.0,
        accel_mm_s2: 300.0,
        ..MoveSpec::default()
    }]);
    machine.start_cycle();
    machine.run_until_stop(2_000_000).unwrap();
    assert!(!machine.pulses.is_empty());

    let path = std::env::temp_dir().join("stepper_sim_pulse_trace.json");
    sim::write_trace(&path, &machine.pulses).unwrap();
    let file = std::fs::File::open(&path).unwrap();
    let decoded: Vec<sim::PulseRecord> = serde_json::from_reader(file).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(decoded, machine.pulses);
}

/// All axes of a diagonal move land on their targets with no extra pulses
/// anywhere in the train.
#[test]
fn diagonal_moves_keep_axes_in_lockstep() {
    let mut machine = machine_with(vec![MoveSpec {
        steps: [800, 800, 0],
        millimeters: 10.0 * std::f32::consts::SQRT_2,
        nominal_speed: 2400.0,
        accel_mm_s2: 400.0,
        ..MoveSpec::default()
    }]);
    machine.start_cycle();
    machine.run_until_stop(2_000_000).unwrap();

    assert_eq!(machine.axis_pulse_count(X_AXIS), 800);
    assert_eq!(machine.axis_pulse_count(Y_AXIS), 800);
    // Equal-count axes pulse on the same ticks.
    for pulse in &machine.pulses {
        let x = pulse.step_bits & (1 << X_AXIS) != 0;
        let y = pulse.step_bits & (1 << Y_AXIS) != 0;
        assert_eq!(x, y, "lockstep broken at t={}", pulse.t_cycles);
    }
}
