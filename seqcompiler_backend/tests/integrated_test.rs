use std::sync::Arc;

use parking_lot::Mutex;
use seqcompiler_backend::device::memory::{ChannelState, MemoryChannel, MemoryTrigger};
use seqcompiler_backend::*;

type State = Arc<Mutex<ChannelState>>;

// One trigger rising at `raise_at`, one 1 GSa/s channel per name
fn bench(raise_at: f64, names: &[&str]) -> (Sequence, Vec<(ChannelId, State)>) {
    let mut seq = Sequence::new(MemoryTrigger::new(), 10e3);
    let trig = seq.add_trigger("trig", 0, raise_at, DEFAULT_DROP_AFTER).unwrap();
    let channels = names
        .iter()
        .map(|name| {
            let awg = MemoryChannel::new(1e9);
            let state = awg.state();
            (seq.link_channel(trig, name, awg).unwrap(), state)
        })
        .collect();
    (seq, channels)
}

fn played(state: &State) -> Vec<f64> {
    state.lock().waveform()
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-12
}

#[test]
fn padding_before_and_behind() {
    let (mut seq, chans) = bench(0., &["a", "b"]);
    let (a, b) = (chans[0].0, chans[1].0);
    let mut slice = Slice::fixed_length("readout", 3e-6);
    slice.add_waveform(a, Waveform::dc(0.1e-6, 1.));
    slice.add_waveform(b, Waveform::dc(0.1e-6, 1.));
    slice.set_waveform_padding(b, PaddingPosition::Behind);
    seq.add_slice(slice).unwrap();
    assert_eq!(seq.setup_channels().unwrap(), 2);

    let before = played(&chans[0].1);
    assert_eq!(before.len(), 3000);
    assert!(before[..2899].iter().all(|v| *v == 0.));
    assert!(before[2901..].iter().all(|v| close(*v, 1.)));

    let behind = played(&chans[1].1);
    assert_eq!(behind.len(), 3000);
    assert!(behind[..99].iter().all(|v| close(*v, 1.)));
    assert!(behind[101..].iter().all(|v| *v == 0.));
}

#[test]
fn concatenation_within_slice() {
    let (mut seq, chans) = bench(0., &["a"]);
    let a = chans[0].0;
    let mut slice = Slice::fixed_length("s", 3e-6);
    for amplitude in [1., 2., 3.] {
        slice.add_waveform(a, Waveform::dc(0.1e-6, amplitude));
    }
    seq.add_slice(slice).unwrap();
    seq.setup_channels().unwrap();

    let compiled = seq.compiled_waveform(a).unwrap();
    assert!((compiled.width() - 3e-6).abs() < 1e-15);
    // 2.7us lead, then 1, 2, 3
    assert_eq!(compiled.at_real(2.65e-6), 0.);
    assert_eq!(compiled.at_real(2.75e-6), 1.);
    assert_eq!(compiled.at_real(2.85e-6), 2.);
    assert_eq!(compiled.at_real(2.95e-6), 3.);

    let samples = played(&chans[0].1);
    assert!(close(samples[2750], 1.));
    assert!(close(samples[2850], 2.));
    assert!(close(samples[2950], 3.));
}

#[test]
fn cross_slice_continuity() {
    let (mut seq, chans) = bench(1e-6, &["a"]);
    let a = chans[0].0;
    seq.add_slice(Slice::fixed_length("wait", 1e-6)).unwrap();
    let mut first = Slice::flex("first");
    first.add_waveform(a, Waveform::dc(1e-6, 1.));
    seq.add_slice(first).unwrap();
    seq.add_slice(Slice::fixed_length("gap", 2e-6)).unwrap();
    let mut second = Slice::flex("second");
    second.add_waveform(a, Waveform::dc(1e-6, 2.));
    seq.add_slice(second).unwrap();
    seq.compile().unwrap();

    // Relative to the trigger: first at 0, second at 3us
    let compiled = seq.compiled_waveform(a).unwrap();
    assert!((compiled.width() - 4e-6).abs() < 1e-15);
    assert_eq!(compiled.at_real(0.5e-6), 1.);
    assert_eq!(compiled.at_real(2e-6), 0.);
    assert_eq!(compiled.at_real(3.5e-6), 2.);
    match compiled {
        Waveform::Sequence(seq) => {
            let blanks: Vec<_> = seq.parts().iter().filter(|p| p.is_blank()).collect();
            assert_eq!(blanks.len(), 1);
            assert!((blanks[0].width() - 2e-6).abs() < 1e-15);
        }
        other => panic!("unexpected {other}"),
    }

    let snapshot = seq.snapshot();
    let starts: Vec<f64> = snapshot.slices.iter().map(|s| s.start).collect();
    assert_eq!(starts.len(), 4);
    assert!(close(starts[3], 4e-6));
}

#[test]
fn overlap_detection() {
    for start_us in [0., 0.5, 1., 1.5, 1.9, 2., 2.5, 3.] {
        let (mut seq, chans) = bench(0., &["a"]);
        let a = chans[0].0;
        let mut first = Slice::fixed("first", 0., 2e-6);
        first.add_waveform(a, Waveform::dc(2e-6, 1.));
        let mut second = Slice::fixed("second", start_us * 1e-6, 1e-6);
        second.add_waveform(a, Waveform::dc(1e-6, 1.));
        seq.add_slice(first).unwrap();
        seq.add_slice(second).unwrap();

        let result = seq.compile();
        if start_us < 2. {
            assert!(
                matches!(
                    &result,
                    Err(Error::Overlap { slice, channel, .. })
                        if slice == "second" && channel == "a"
                ),
                "start {start_us}us: {result:?}"
            );
            assert!(seq.compiled_waveform(a).is_none());
        } else {
            assert!(result.is_ok(), "start {start_us}us: {result:?}");
        }
    }
}

#[test]
fn pre_trigger_detection() {
    let (mut seq, chans) = bench(2e-6, &["a"]);
    let a = chans[0].0;
    let mut early = Slice::fixed("early", 1e-6, 1e-6);
    early.add_waveform(a, Waveform::dc(1e-6, 1.));
    seq.add_slice(early).unwrap();

    let err = seq.setup_channels().unwrap_err();
    assert!(matches!(err, Error::PreTrigger { .. }));
    assert!(err.is_description_error());
    let state = chans[0].1.lock();
    assert_eq!((state.stops, state.writes), (0, 0));
}

#[test]
fn sub_slice_alignment() {
    let (mut seq, chans) = bench(0., &["a", "b"]);
    let (a, b) = (chans[0].0, chans[1].0);
    let mut parent = Slice::fixed_length("parent", 5e-6);
    for (name, width, amplitude) in [("x", 1e-6, 1.), ("y", 0.5e-6, 2.), ("z", 1.5e-6, 3.)] {
        let mut child = Slice::flex(name);
        child.add_waveform(a, Waveform::dc(width, amplitude));
        parent.add_sub_slice(child).unwrap();
    }
    parent
        .sub_slice_("y")
        .unwrap()
        .add_waveform(b, Waveform::dc(0.5e-6, -1.));
    seq.add_slice(parent).unwrap();
    seq.setup_channels().unwrap();

    // Children fill 3us and are padded before up to 5us
    let wa = seq.compiled_waveform(a).unwrap();
    assert_eq!(wa.at_real(1.5e-6), 0.);
    assert_eq!(wa.at_real(2.5e-6), 1.);
    assert_eq!(wa.at_real(3.25e-6), 2.);
    assert_eq!(wa.at_real(4e-6), 3.);
    let wb = seq.compiled_waveform(b).unwrap();
    assert_eq!(wb.at_real(2.5e-6), 0.);
    assert_eq!(wb.at_real(3.25e-6), -1.);
    assert_eq!(wb.at_real(4e-6), 0.);

    let samples = played(&chans[1].1);
    assert_eq!(samples.len(), 5000);
    assert!(close(samples[3250], -1.));
}

#[test]
fn recompile_is_idempotent() {
    let (mut seq, chans) = bench(0., &["a", "b"]);
    let mut slice = Slice::flex("s");
    slice.add_waveform(chans[0].0, Waveform::gaussian(1e-6, 0.5));
    slice.add_waveform(chans[1].0, Waveform::sin(1e-6, 0.2, 1e7, 0.));
    seq.add_slice(slice).unwrap();
    seq.setup_channels().unwrap();
    let first: Vec<Vec<f64>> = chans.iter().map(|(_, s)| played(s)).collect();
    let generation = seq.snapshot().generation;

    assert!(seq.compile().unwrap().is_empty());
    assert_eq!(seq.program().unwrap(), 0);
    let second: Vec<Vec<f64>> = chans.iter().map(|(_, s)| played(s)).collect();
    assert_eq!(first, second);
    assert!(chans.iter().all(|(_, s)| s.lock().writes == 1));
    assert_eq!(seq.snapshot().generation, generation + 1);
}

#[test]
fn sample_round_trip() {
    for (width, rate) in [(1e-6, 1e9), (2.5e-6, 2e9), (333e-9, 1.2e9), (10e-6, 250e6)] {
        let waveform = Waveform::blank(width / 2.).concat(Waveform::dc(width / 2., 1.));
        let samples = waveform.sample(rate, 1);
        let recovered = samples.len() as f64 / rate;
        assert!(
            recovered >= waveform.width() - 1e-15 && recovered - waveform.width() < 1. / rate,
            "{width} at {rate}"
        );
    }
}

#[test]
fn calibrated_iq_cannot_be_scaled() {
    let iq: Waveform = CalibratedIq::new(
        100e6,
        Some(Waveform::gaussian(40e-9, 1.)),
        Some(Waveform::gaussian(40e-9, 0.5)),
        Some(&IqCalibration::default()),
        Conversion::Up,
    )
    .unwrap()
    .into();
    let err = iq.clone().real().scale(0.5).unwrap_err();
    assert!(matches!(err, Error::ScaleCalibrated));
    // Scaling the inputs instead is fine
    assert!(Waveform::gaussian(40e-9, 1.).scale(0.5).is_ok());
    assert!(iq.imag().negate().is_err());
}

#[test]
fn incremental_recompile() {
    let (mut seq, chans) = bench(0., &["a", "b", "c"]);
    let mut slice = Slice::flex("s");
    for (chan, _) in &chans {
        slice.add_waveform(*chan, Waveform::dc(1e-6, 0.5));
    }
    seq.add_slice(slice).unwrap();
    assert_eq!(seq.setup_channels().unwrap(), 3);

    // Same width, new content: only b
    seq.clear_waveform("s", "b").unwrap();
    seq.add_waveform("s", "b", Waveform::dc(1e-6, 0.25)).unwrap();
    assert_eq!(seq.compile().unwrap().into_iter().collect::<Vec<_>>(), vec![chans[1].0]);
    assert_eq!(seq.program().unwrap(), 1);
    let writes: Vec<usize> = chans.iter().map(|(_, s)| s.lock().writes).collect();
    assert_eq!(writes, vec![1, 2, 1]);
    assert!(close(played(&chans[1].1)[10], 0.25));
}

#[test]
fn inspected_sub_slice_edit_is_recompiled() {
    let (mut seq, chans) = bench(0., &["a"]);
    let a = chans[0].0;
    let mut outer = Slice::flex("outer");
    outer.add_sub_slice(Slice::flex("inner")).unwrap();
    seq.add_slice(outer).unwrap();
    seq.add_waveform("outer/inner", "a", Waveform::dc(1e-6, 1.)).unwrap();
    assert_eq!(seq.setup_channels().unwrap(), 1);

    seq.clear_waveform("outer/inner", "a").unwrap();
    seq.add_waveform("outer/inner", "a", Waveform::dc(1e-6, 0.25)).unwrap();
    // Looking at the sub slice flattens it before the sequence does
    let registry = seq.registry().clone();
    let inner = seq.slice_path_("outer/inner").unwrap();
    let seen = inner.get_waveform(a, &registry).unwrap().unwrap();
    assert_eq!(seen.at_real(0.5e-6), 0.25);

    assert_eq!(seq.compile().unwrap().into_iter().collect::<Vec<_>>(), vec![a]);
    assert_eq!(seq.compiled_waveform(a).unwrap().at_real(0.5e-6), 0.25);
    assert_eq!(seq.program().unwrap(), 1);
    assert!(close(played(&chans[0].1)[500], 0.25));
}

#[test]
fn later_slices_follow_a_stretched_slice() {
    let (mut seq, chans) = bench(0., &["a", "b"]);
    let (a, b) = (chans[0].0, chans[1].0);
    let mut first = Slice::flex("first");
    first.add_waveform(a, Waveform::dc(1e-6, 1.));
    let mut second = Slice::flex("second");
    second.add_waveform(b, Waveform::dc(1e-6, 1.));
    seq.add_slice(first).unwrap();
    seq.add_slice(second).unwrap();
    seq.setup_channels().unwrap();

    seq.add_waveform("first", "a", Waveform::dc(1e-6, 1.)).unwrap();
    let recompiled = seq.compile().unwrap();
    assert!(recompiled.contains(&a) && recompiled.contains(&b));
    let wb = seq.compiled_waveform(b).unwrap();
    assert_eq!(wb.at_real(1.5e-6), 0.);
    assert_eq!(wb.at_real(2.5e-6), 1.);
}

#[test]
fn failed_compile_is_retried() {
    let (mut seq, chans) = bench(0., &["a", "b"]);
    let (a, b) = (chans[0].0, chans[1].0);
    let mut first = Slice::fixed("first", 0., 2e-6);
    first.add_waveform(a, Waveform::dc(1e-6, 1.));
    let second = Slice::fixed("second", 3e-6, 2e-6);
    seq.add_slice(first).unwrap();
    seq.add_slice(second).unwrap();
    seq.setup_channels().unwrap();

    // Edit a, and break b with content overflowing its slice
    seq.clear_waveform("first", "a").unwrap();
    seq.add_waveform("first", "a", Waveform::dc(1e-6, 0.5)).unwrap();
    seq.add_waveform("second", "b", Waveform::dc(3e-6, 1.)).unwrap();
    assert!(matches!(
        seq.setup_channels(),
        Err(Error::SliceOverflow { slice, .. }) if slice == "second"
    ));
    assert_eq!(seq.compiled_waveform(a).unwrap().at_real(1.5e-6), 1.);
    assert_eq!(chans[0].1.lock().writes, 1);
    assert_eq!(chans[1].1.lock().writes, 0);

    seq.clear_waveform("second", "b").unwrap();
    seq.add_waveform("second", "b", Waveform::dc(2e-6, 1.)).unwrap();
    let recompiled = seq.compile().unwrap();
    assert!(recompiled.contains(&a) && recompiled.contains(&b));
    assert_eq!(seq.compiled_waveform(a).unwrap().at_real(1.5e-6), 0.5);
    assert_eq!(seq.program().unwrap(), 2);
}

#[test]
fn failed_write_stays_pending() {
    let (mut seq, chans) = bench(0., &["a"]);
    let mut slice = Slice::flex("s");
    slice.add_waveform(chans[0].0, Waveform::dc(1e-6, 1.));
    seq.add_slice(slice).unwrap();
    chans[0].1.lock().fail_writes = true;

    match seq.setup_channels() {
        Err(Error::Device {
            channel, operation, ..
        }) => {
            assert_eq!(channel, "a");
            assert_eq!(operation, "write_raw_waveform");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(seq.pending_program().contains(&chans[0].0));

    chans[0].1.lock().fail_writes = false;
    assert_eq!(seq.program().unwrap(), 1);
    assert!(seq.pending_program().is_empty());
    assert_eq!(chans[0].1.lock().writes, 1);
}

#[test]
fn trigger_and_offsets() {
    let trigger = MemoryTrigger::new();
    let trigger_state = trigger.state();
    let mut seq = Sequence::new(trigger, 5e3);
    let t = seq.add_trigger("t", 3, 1e-6, 2e-6).unwrap();
    let i_awg = MemoryChannel::new(1e9);
    let q_awg = MemoryChannel::new(1e9);
    let (i_state, q_state) = (i_awg.state(), q_awg.state());
    seq.link_channel(t, "i", i_awg).unwrap();
    seq.link_channel(t, "q", q_awg).unwrap();

    seq.setup_trigger().unwrap();
    {
        let state = trigger_state.lock();
        assert_eq!(state.cycle_frequency, Some(5e3));
        assert_eq!(state.delays[&3], (1e-6, 2e-6));
    }

    let calibration = IqCalibration {
        i_offset: 0.01,
        q_offset: -0.02,
        ..IqCalibration::default()
    };
    seq.apply_iq_offsets("i", "q", &calibration).unwrap();
    assert_eq!(i_state.lock().offset, 0.01);
    assert_eq!(q_state.lock().offset, -0.02);

    seq.stop_channels().unwrap();
    assert_eq!(i_state.lock().stops, 1);
}

#[test]
fn iq_pair_on_two_channels() {
    let (mut seq, chans) = bench(0., &["i", "q"]);
    let iq: Waveform = CalibratedIq::new(
        50e6,
        Some(Waveform::dc(200e-9, 1.)),
        None,
        None,
        Conversion::Up,
    )
    .unwrap()
    .into();
    let mut drive = Slice::flex("drive");
    drive.add_waveform(chans[0].0, iq.clone().real());
    drive.add_waveform(chans[1].0, iq.imag());
    seq.add_slice(drive).unwrap();
    seq.setup_channels().unwrap();

    let (i, q) = (played(&chans[0].1), played(&chans[1].1));
    let omega = 2. * std::f64::consts::PI * 50e6;
    for k in [0, 3, 17, 150] {
        let t = k as f64 / 1e9;
        assert!((i[k] - (omega * t).cos()).abs() < 1e-9);
        assert!((q[k] + (omega * t).sin()).abs() < 1e-9);
    }
}

#[test]
fn snapshot_readers_see_consistent_cycles() {
    let (mut seq, chans) = bench(0., &["a", "b"]);
    seq.add_slice(Slice::flex("s")).unwrap();
    let reader = seq.snapshot_reader();

    std::thread::scope(|scope| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = reader.clone();
                scope.spawn(move || {
                    let mut last = 0;
                    for _ in 0..200 {
                        let snapshot = reader.load();
                        assert!(snapshot.generation >= last);
                        last = snapshot.generation;
                        let values: Vec<f64> = snapshot
                            .channels
                            .iter()
                            .map(|c| c.waveform.at_real(0.))
                            .collect();
                        // Both channels always carry the same amplitude
                        assert!(values.windows(2).all(|w| w[0] == w[1]));
                    }
                })
            })
            .collect();

        for k in 1..=50 {
            let amplitude = k as f64 / 50.;
            for (chan, _) in &chans {
                let slice = seq.slice_("s").unwrap();
                slice.clear_waveform(*chan);
                slice.add_waveform(*chan, Waveform::dc(1e-6, amplitude));
            }
            seq.compile().unwrap();
        }
        for handle in readers {
            handle.join().unwrap();
        }
    });

    let snapshot = seq.snapshot();
    assert_eq!(snapshot.generation, 50);
    assert_eq!(snapshot.channels.len(), 2);
    assert!(close(snapshot.channel("b").unwrap().waveform.at_real(0.), 1.));
}
