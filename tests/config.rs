// Shipped configuration files load and drive the rest of the stack

use kinstep::motion::{self, AxisInputShaper, MotionError, ShaperType, StepGenerator};
use kinstep::shared::config::{load_config, CarriageMode, Config};
use kinstep::shared::trapq::{Coord, TrapQueue};
use kinstep::simulator::{load_scenario, HomingSimulator};
use kinstep::trsync::REASON_ENDSTOP_HIT;

fn repo_file(name: &str) -> String {
    format!("{}/{}", env!("CARGO_MANIFEST_DIR"), name)
}

#[test]
fn sample_printer_config_builds_shaped_corexy() {
    let config = load_config(&repo_file("printer.toml")).unwrap();
    assert_eq!(config.printer.kinematics, "corexy");
    let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
    for stepper in motion::build_steppers(&config).unwrap() {
        sg.add_stepper(stepper);
    }
    let mut extruder = motion::build_extruder(config.extruder.as_ref().unwrap()).unwrap();
    extruder.set_trapq(Some(TrapQueue::new().into_shared()));
    sg.add_stepper(extruder);
    let mut shapers = AxisInputShaper::from_config(config.input_shaper.as_ref().unwrap()).unwrap();
    sg.configure_input_shaper(&mut shapers).unwrap();
    assert_eq!(sg.steppers().len(), 4);
    assert!(sg.kin_flush_delay() >= 0.02);
    let names: Vec<&str> = sg.steppers().iter().map(|s| s.kinematics().name()).collect();
    assert_eq!(names, vec!["input_shaper", "input_shaper", "cartesian", "extruder"]);

    let (end, _) = sg
        .queue_move(0.1, Coord::default(), Coord::new(5.0, 0.0, 0.0), 100.0, 3000.0)
        .unwrap();
    let mut steps = 0;
    let mut flush_time = 0.1;
    while flush_time < end + 2.0 * sg.kin_flush_delay() {
        flush_time += 0.05;
        steps += sg.flush(flush_time).unwrap().get("stepper_a").map_or(0, Vec::len);
    }
    assert_eq!(steps, 400);
}

#[test]
fn idex_shaper_entries_follow_carriage_mode() {
    let config: Config = toml::from_str(
        r#"
[printer]
kinematics = "cartesian"

[stepper.stepper_x]
[stepper.stepper_y]
[stepper.dual_carriage]
axis = "x"

[dual_carriage]
stepper = "dual_carriage"
mode = "copy"
offset = 150.0

[input_shaper]
shaper_type_x = "mzv, mzv, ei, zvd"
shaper_freq_x = [48.0, 50.0, 40.0, 36.0]
shaper_type_y = ["ei"]
shaper_freq_y = 39.0
"#,
    )
    .unwrap();
    config.validate().unwrap();
    let mut sg = StepGenerator::new(TrapQueue::new().into_shared());
    for mut stepper in motion::build_steppers(&config).unwrap() {
        stepper.set_position(0.0, 0.0, 0.0);
        sg.add_stepper(stepper);
    }
    let mut shapers = AxisInputShaper::from_config(config.input_shaper.as_ref().unwrap()).unwrap();
    sg.handle_dual_carriage_mode_change(&mut shapers, 0, CarriageMode::Copy).unwrap();
    assert_eq!((shapers[0].shaper_type(), shapers[0].freq()), (ShaperType::Ei, 40.0));
    assert_eq!((shapers[1].shaper_type(), shapers[1].freq()), (ShaperType::Ei, 39.0));
    let names: Vec<&str> = sg.steppers().iter().map(|s| s.kinematics().name()).collect();
    assert_eq!(names, vec!["input_shaper"; 3]);

    // Both carriages step together in copy mode
    let (end, _) = sg
        .queue_move(0.1, Coord::default(), Coord::new(5.0, 0.0, 0.0), 100.0, 3000.0)
        .unwrap();
    let mut counts = std::collections::BTreeMap::new();
    let mut flush_time = 0.1;
    while flush_time < end + 2.0 * sg.kin_flush_delay() {
        flush_time += 0.05;
        for (name, steps) in sg.flush(flush_time).unwrap() {
            *counts.entry(name).or_insert(0) += steps.len();
        }
    }
    assert_eq!(counts["stepper_x"], 400);
    assert_eq!(counts["dual_carriage"], 400);
    assert!(!counts.contains_key("stepper_y"));

    sg.set_carriage_transform("dual_carriage", 'x', 0.0, 300.0).unwrap();
    sg.handle_dual_carriage_mode_change(&mut shapers, 1, CarriageMode::Primary).unwrap();
    assert_eq!((shapers[0].shaper_type(), shapers[0].freq()), (ShaperType::Mzv, 50.0));
    assert_eq!(sg.input_shaper_report(&shapers)[0], "Active toolhead: 1, Mode: PRIMARY");
}

#[test]
fn winch_needs_one_anchor_per_stepper() {
    let mut config: Config = toml::from_str(
        r#"
[printer]
kinematics = "winch"

[winch]
anchors = [[0.0, 0.0, 300.0], [300.0, 0.0, 300.0], [0.0, 300.0, 300.0]]

[stepper.winch_a]
[stepper.winch_b]
"#,
    )
    .unwrap();
    config.validate().unwrap();
    assert!(matches!(motion::build_steppers(&config), Err(MotionError::Config(_))));
    config.steppers.insert("winch_c".to_string(), Default::default());
    let handles = motion::build_steppers(&config).unwrap();
    let lengths: Vec<f64> = handles
        .iter()
        .map(|h| h.calc_position_from_coord(0.0, 0.0, 0.0))
        .collect();
    assert_eq!(lengths[0], 300.0);
    assert!((lengths[1] - 300.0 * 2f64.sqrt()).abs() < 1e-9);
}

#[test]
fn sample_scenario_runs_to_a_trigger() {
    let scenario = load_scenario(std::path::Path::new(&repo_file("kinstep_simulator/scenarios/two_mcu.toml"))).unwrap();
    let mut sim = HomingSimulator::new(scenario).unwrap();
    let report = sim.run().unwrap();
    assert_eq!(report.trigger_mcu.as_deref(), Some("toolboard"));
    assert!(report.lapse.is_none());
    assert!(!report.stopped_by_host);
    assert_eq!(report.mcus[0].trip_reason, Some(REASON_ENDSTOP_HIT));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["trigger"]["trigger_reason"], REASON_ENDSTOP_HIT);
}
