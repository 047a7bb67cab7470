use std::f64::consts::PI;

use seqcompiler_backend::device::memory::{MemoryChannel, MemoryTrigger};
use seqcompiler_backend::*;

// Drives a readout + drive cycle against in-memory devices and prints what got loaded.
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let trigger = MemoryTrigger::new();
    let trigger_state = trigger.state();
    let mut seq = Sequence::new(trigger, 10e3);

    let drive_trig = seq.add_trigger("drive_trig", 1, 0., DEFAULT_DROP_AFTER)?;
    let probe_trig = seq.add_trigger("probe_trig", 2, 2e-6, DEFAULT_DROP_AFTER)?;

    let mut states = Vec::new();
    for (trigger, name) in [
        (drive_trig, "drive_i"),
        (drive_trig, "drive_q"),
        (probe_trig, "probe"),
    ] {
        let awg = MemoryChannel::new(1e9).with_min_unit(DEFAULT_MIN_UNIT);
        states.push((name, awg.state()));
        seq.link_channel(trigger, name, awg)?;
    }

    let calibration = IqCalibration {
        i_offset: 0.012,
        q_offset: -0.008,
        q_amp_factor: 0.97,
        q_phase_shift: 0.03,
        ..IqCalibration::default()
    };
    let pi_pulse: Waveform = CalibratedIq::new(
        50e6,
        Some(Waveform::gaussian(40e-9, 0.6)),
        None,
        Some(&calibration),
        Conversion::Up,
    )?
    .into();

    let mut drive = Slice::flex("drive");
    drive.add_sub_slice(Slice::flex("pi_pulse"))?;
    seq.add_slice(Slice::fixed_length("wait", 2e-6))?;
    seq.add_slice(drive)?;
    seq.add_waveform("drive/pi_pulse", "drive_i", pi_pulse.clone().real())?;
    seq.add_waveform("drive/pi_pulse", "drive_q", pi_pulse.imag())?;

    let mut readout = Slice::fixed("readout", 4e-6, 2e-6);
    let probe = Waveform::cos(1e-6, 0.25, 2. * PI * 20e6, 0.);
    readout.add_waveform(seq.channel_id("probe")?, probe);
    seq.add_slice(readout)?;

    seq.apply_iq_offsets("drive_i", "drive_q", &calibration)?;
    seq.setup()?;
    seq.run_channels()?;

    println!("{:?}", trigger_state.lock());
    for (name, state) in &states {
        let state = state.lock();
        println!(
            "{name}: {} samples, peak {:.3} V, offset {} V",
            state.samples.len(),
            state.amplitude,
            state.offset
        );
    }
    if let Some(waveform) = seq.compiled_waveform(seq.channel_id("drive_i")?) {
        println!("{waveform}");
    }

    // Stretch the pulse: only the drive channels get rewritten
    let envelope = Some(Waveform::gaussian(80e-9, 0.3));
    let longer: Waveform =
        CalibratedIq::new(50e6, envelope, None, Some(&calibration), Conversion::Up)?.into();
    seq.clear_waveform("drive/pi_pulse", "drive_i")?;
    seq.clear_waveform("drive/pi_pulse", "drive_q")?;
    seq.add_waveform("drive/pi_pulse", "drive_i", longer.clone().real())?;
    seq.add_waveform("drive/pi_pulse", "drive_q", longer.imag())?;
    println!("reprogrammed {} channel(s)", seq.setup_channels()?);
    Ok(())
}
