//! Demo host: a 1 kHz sine generator with a tick counter.
//!
//! Parameters (amplitude, frequency) are adjustable over the control
//! socket; the waveform streams to telemetry clients on TCP.

use cadence::channel::{ChannelDescriptor, ElemType};
use cadence::task::StepFault;
use cadence::{Host, HostConfig, TaskDescriptor, TaskStep};
use std::f64::consts::TAU;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

const PERIOD: Duration = Duration::from_millis(1);

struct SineStep {
    tick: u32,
}

impl TaskStep for SineStep {
    fn step(&mut self, _sub: usize, image: &mut [u8], params: &[u8]) -> Result<(), StepFault> {
        let amplitude = f64::from_le_bytes(
            params[0..8]
                .try_into()
                .map_err(|_| StepFault("parameter block too short".into()))?,
        );
        let frequency = f64::from_le_bytes(
            params[8..16]
                .try_into()
                .map_err(|_| StepFault("parameter block too short".into()))?,
        );

        let t = f64::from(self.tick) * PERIOD.as_secs_f64();
        let value = amplitude * (TAU * frequency * t).sin();
        image[0..4].copy_from_slice(&self.tick.to_le_bytes());
        image[4..12].copy_from_slice(&value.to_le_bytes());
        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }
}

fn sine_descriptor() -> TaskDescriptor {
    let mut desc = TaskDescriptor::new(
        "sine",
        "sine-1.0",
        vec![PERIOD],
        12,
        Box::new(SineStep { tick: 0 }),
    );
    desc.signals = vec![
        ChannelDescriptor::vector(0, "/sine/tick", 0, 1, ElemType::U32),
        ChannelDescriptor::vector(1, "/sine/value", 4, 1, ElemType::F64),
    ];
    desc.parameters = vec![
        ChannelDescriptor::vector(0, "/sine/amplitude", 0, 1, ElemType::F64),
        ChannelDescriptor::vector(1, "/sine/frequency", 8, 1, ElemType::F64),
    ];
    let mut initial = Vec::with_capacity(16);
    initial.extend_from_slice(&1.0f64.to_le_bytes());
    initial.extend_from_slice(&50.0f64.to_le_bytes());
    desc.initial_params = initial;
    desc
}

fn main() -> std::io::Result<()> {
    cadence::trace::init_tracing();

    let host = Host::new(HostConfig::default());
    host.start_task(sine_descriptor())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

    let run_forever = AtomicBool::new(false);
    host.serve(&run_forever)
}
