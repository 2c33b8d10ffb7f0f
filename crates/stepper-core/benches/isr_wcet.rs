//! Worst-case execution time of the step interrupt body against null
//! hardware, as a proxy for the deadline the real timer imposes.

use criterion::{criterion_group, criterion_main, Criterion};
use embedded_hal::delay::DelayNs;

use stepper_core::config::MAX_AMASS_LEVEL;
use stepper_core::{
    DriverEnable, MotionHardware, Probe, Segment, SegmentBuffer, Settings, Spindle, StepExecutor,
    StepPort, StepTimer, StepperBlock, SystemState,
};

struct NullPort;
impl StepPort for NullPort {
    fn write_step_bits(&mut self, _bits: u8) {}
    fn write_dir_bits(&mut self, _bits: u8) {}
}

struct NullTimer;
impl StepTimer for NullTimer {
    fn set_reload(&mut self, _cycles_per_tick: u16) {}
    fn set_pulse_compare(&mut self, _cycles: u16) {}
    fn start(&mut self) {}
    fn stop(&mut self) {}
}

struct NullSpindle;
impl Spindle for NullSpindle {
    fn compute_pwm_value(&self, rpm: f32) -> u16 {
        rpm as u16
    }
    fn pwm_off_value(&self) -> u16 {
        0
    }
    fn set_speed(&mut self, _pwm: u16) {}
}

struct NullProbe;
impl Probe for NullProbe {
    fn state_monitor(&mut self, _system: &SystemState) {}
}

struct NullEnable;
impl DriverEnable for NullEnable {
    fn set_line(&mut self, _high: bool) {}
}

struct NullDelay;
impl DelayNs for NullDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

fn bench_step_isr(c: &mut Criterion) {
    let mut buffer = SegmentBuffer::new();
    let (mut producer, consumer) = buffer.split();
    let settings = Settings::new();
    let system = SystemState::new();

    let mut hw = MotionHardware {
        step_port: NullPort,
        timer: NullTimer,
        spindle: NullSpindle,
        probe: NullProbe,
        enable: NullEnable,
        delay: NullDelay,
    };

    // A worst-case-ish block: all three axes stepping.
    let block = StepperBlock {
        steps: [
            2000 << MAX_AMASS_LEVEL,
            1999 << MAX_AMASS_LEVEL,
            1998 << MAX_AMASS_LEVEL,
        ],
        step_event_count: 2000 << MAX_AMASS_LEVEL,
        direction_bits: 0b010,
        is_pwm_rate_adjusted: false,
    };
    unsafe { producer.store_block(1, block) };

    let mut executor = StepExecutor::new(consumer, &settings);

    c.bench_function("step_isr_tick", |b| {
        b.iter(|| {
            if executor.current_segment().is_none() {
                let _ = producer.push(Segment {
                    n_step: u16::MAX,
                    cycles_per_tick: 800,
                    st_block_index: 1,
                    amass_level: 0,
                    spindle_pwm: 0,
                    backlash_motion: false,
                });
            }
            executor.on_timer_tick(&mut hw, &settings, &system);
        })
    });
}

criterion_group!(benches, bench_step_isr);
criterion_main!(benches);
