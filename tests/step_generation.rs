// End-to-end step generation: config -> steppers -> queued moves -> flushed steps

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use kinstep::motion::{self, StepEvent, StepGenerator};
use kinstep::shared::config::{load_config, Config};
use kinstep::shared::trapq::{Coord, TrapQueue};

fn load(contents: &str) -> Config {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    load_config(file.path().to_str().unwrap()).unwrap()
}

fn generator(config: &Config) -> StepGenerator {
    let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
    for mut stepper in motion::build_steppers(config).unwrap() {
        stepper.set_position(0.0, 0.0, 0.0);
        sg.add_stepper(stepper);
    }
    sg
}

fn flush_all(sg: &mut StepGenerator, from: f64, end_time: f64) -> BTreeMap<String, Vec<StepEvent>> {
    let mut all: BTreeMap<String, Vec<StepEvent>> = BTreeMap::new();
    let mut flush_time = from;
    while flush_time < end_time + 2.0 * sg.kin_flush_delay() {
        flush_time += 0.05;
        for (name, steps) in sg.flush(flush_time).unwrap() {
            all.entry(name).or_default().extend(steps);
        }
    }
    all
}

fn net(steps: Option<&Vec<StepEvent>>) -> i64 {
    steps.map_or(0, |s| s.iter().map(|e| i64::from(e.dir)).sum())
}

fn assert_ordered(steps: &[StepEvent]) {
    for pair in steps.windows(2) {
        assert!(pair[1].print_time > pair[0].print_time);
    }
}

#[test]
fn corexy_diagonal_moves_one_belt() {
    let config = load(
        r#"
[printer]
kinematics = "corexy"

[stepper.stepper_a]
axis = "+"

[stepper.stepper_b]
axis = "-"
"#,
    );
    let mut sg = generator(&config);
    let (end, _) = sg
        .queue_move(0.1, Coord::default(), Coord::new(10.0, 10.0, 0.0), 100.0, 1000.0)
        .unwrap();
    let steps = flush_all(&mut sg, 0.1, end);
    let a = &steps["stepper_a"];
    assert_eq!(a.len(), 1600);
    assert!(a.iter().all(|s| s.dir == 1));
    assert_ordered(a);
    assert!(a[0].print_time >= 0.1 && a[a.len() - 1].print_time <= end);
    assert!(!steps.contains_key("stepper_b"));
}

#[test]
fn delta_vertical_move_raises_all_carriages() {
    let config = load(
        r#"
[printer]
kinematics = "delta"

[delta]
radius = 100.0
arm_length = 250.0

[stepper.stepper_a]
[stepper.stepper_b]
[stepper.stepper_c]
"#,
    );
    let mut sg = generator(&config);
    let (end, _) = sg
        .queue_move(0.1, Coord::default(), Coord::new(0.0, 0.0, 10.0), 50.0, 500.0)
        .unwrap();
    let steps = flush_all(&mut sg, 0.1, end);
    for name in ["stepper_a", "stepper_b", "stepper_c"] {
        assert_eq!(steps[name].len(), 800, "{}", name);
        assert_eq!(net(steps.get(name)), 800);
        assert_ordered(&steps[name]);
    }
}

#[test]
fn out_and_back_returns_every_stepper_home() {
    let config = load(
        r#"
[stepper.stepper_x]
[stepper.stepper_y]
[stepper.stepper_z]
rotation_distance = 8.0
"#,
    );
    let mut sg = generator(&config);
    let target = Coord::new(20.0, -15.0, 2.0);
    let (mid, _) = sg.queue_move(0.1, Coord::default(), target, 200.0, 3000.0).unwrap();
    let (end, _) = sg.queue_move(mid, target, Coord::default(), 200.0, 3000.0).unwrap();
    let steps = flush_all(&mut sg, 0.1, end);
    for stepper in sg.steppers() {
        assert_eq!(net(steps.get(stepper.name())), 0, "{}", stepper.name());
        assert!(stepper.commanded_pos().abs() < 1e-9);
        assert_ordered(&steps[stepper.name()]);
    }
    assert_eq!(steps["stepper_x"].len(), 3200);
    assert_eq!(steps["stepper_y"].len(), 2400);
    assert_eq!(steps["stepper_z"].len(), 1600);
}

#[test]
fn pressure_advanced_extrusion_ends_at_commanded_filament() {
    let config = load(
        r#"
[stepper.stepper_x]

[extruder]
rotation_distance = 20.0
pressure_advance = 0.05
pressure_advance_smooth_time = 0.04
"#,
    );
    let mut sg = generator(&config);
    let mut extruder = motion::build_extruder(config.extruder.as_ref().unwrap()).unwrap();
    let e_queue = TrapQueue::new().into_shared();
    extruder.set_trapq(Some(Arc::clone(&e_queue)));
    let e_step = extruder.step_dist();
    sg.add_stepper(extruder);
    assert!(sg.kin_flush_delay() >= 0.02);

    let (end, timing) = sg
        .queue_move(0.1, Coord::default(), Coord::new(40.0, 0.0, 0.0), 100.0, 2000.0)
        .unwrap();
    StepGenerator::queue_extrude(&e_queue, 0.1, &timing, 0.0, 2.0).unwrap();
    let steps = flush_all(&mut sg, 0.1, end);

    let e = &steps["extruder"];
    assert_ordered(e);
    let expected = (2.0 / e_step).round() as i64;
    assert!((net(Some(e)) - expected).abs() <= 1, "net {} expected {}", net(Some(e)), expected);
    // Advance pushes filament ahead of the nominal position while accelerating
    let lead = e.iter().find(|s| s.print_time > 0.1 + timing.accel_t * 0.5).unwrap();
    let nominal = 2.0 / 40.0 * 0.5 * 2000.0 * (lead.print_time - 0.1).powi(2);
    assert!(lead.position > nominal);
}
