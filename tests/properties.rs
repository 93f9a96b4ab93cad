// Property tests for the iterative step solver

use kinstep::motion::kinematics::{CartesianStepper, WinchStepper};
use kinstep::motion::{MoveTiming, StepperHandle};
use kinstep::shared::trapq::{Coord, TrapQueue};
use proptest::prelude::*;

const STEP: f64 = 0.01;

fn queue_line(tq: &mut TrapQueue, print_time: f64, start: Coord, dir: Coord, distance: f64, v: f64, a: f64) -> f64 {
    let t = MoveTiming::plan(distance, v, a);
    tq.append(print_time, t.accel_t, t.cruise_t, t.decel_t, start, dir, 0.0, t.cruise_v, t.accel)
        .unwrap();
    tq.end_time().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn steps_cover_the_move_in_order(
        distance in 0.05f64..40.0,
        max_v in 5.0f64..300.0,
        accel in 100.0f64..5000.0,
    ) {
        let mut tq = TrapQueue::new();
        let end = queue_line(&mut tq, 1.0, Coord::default(), Coord::new(1.0, 0.0, 0.0), distance, max_v, accel);
        let mut stepper = StepperHandle::new("stepper_x", STEP, Box::new(CartesianStepper::new('x').unwrap()));
        stepper.set_trapq(Some(tq.into_shared()));
        let steps = stepper.advance(end).unwrap();

        prop_assert!((steps.len() as f64 - distance / STEP).abs() <= 1.0);
        prop_assert!(steps.iter().all(|s| s.dir == 1));
        for pair in steps.windows(2) {
            prop_assert!(pair[1].print_time > pair[0].print_time);
        }
        prop_assert!(steps.first().map_or(true, |s| s.print_time >= 1.0));
        prop_assert!(steps.last().map_or(true, |s| s.print_time <= end));
        prop_assert!((stepper.commanded_pos() - distance).abs() <= STEP);
    }

    #[test]
    fn out_and_back_nets_zero(
        whole_steps in 10u32..2000,
        max_v in 5.0f64..200.0,
        accel in 100.0f64..3000.0,
    ) {
        // Turn around a quarter step past a step boundary
        let distance = f64::from(whole_steps) * STEP + 0.25 * STEP;
        let mut tq = TrapQueue::new();
        let out = Coord::new(1.0, 0.0, 0.0);
        let back = Coord::new(-1.0, 0.0, 0.0);
        let mid = queue_line(&mut tq, 1.0, Coord::default(), out, distance, max_v, accel);
        let end = queue_line(&mut tq, mid, Coord::new(distance, 0.0, 0.0), back, distance, max_v, accel);
        let mut stepper = StepperHandle::new("stepper_x", STEP, Box::new(CartesianStepper::new('x').unwrap()));
        stepper.set_trapq(Some(tq.into_shared()));
        let steps = stepper.advance(end).unwrap();

        let net: i64 = steps.iter().map(|s| i64::from(s.dir)).sum();
        prop_assert_eq!(net, 0);
        prop_assert_eq!(steps.len() as u32, 2 * whole_steps);
        for pair in steps.windows(2) {
            prop_assert!(pair[1].print_time > pair[0].print_time);
        }
    }

    #[test]
    fn winch_steps_track_cable_length(
        x in -100.0f64..100.0,
        y in -100.0f64..100.0,
    ) {
        prop_assume!(x.hypot(y) > 1.0);
        let anchor = Coord::new(0.0, 0.0, 200.0);
        let target = Coord::new(x, y, 0.0);
        let distance = x.hypot(y);
        let mut tq = TrapQueue::new();
        let dir = Coord::new(x / distance, y / distance, 0.0);
        let end = queue_line(&mut tq, 1.0, Coord::default(), dir, distance, 100.0, 2000.0);
        let mut stepper = StepperHandle::new("winch", STEP, Box::new(WinchStepper::new(anchor)));
        stepper.set_position(0.0, 0.0, 0.0);
        stepper.set_trapq(Some(tq.into_shared()));
        let steps = stepper.advance(end).unwrap();

        let expected = stepper.calc_position_from_coord(target.x, target.y, target.z);
        prop_assert!((stepper.commanded_pos() - expected).abs() <= STEP);
        // Moving away from the anchor's foot only ever lengthens the cable
        prop_assert!(steps.iter().all(|s| s.dir == 1));
    }
}
