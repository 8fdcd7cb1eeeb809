use chelper::trapq::{Coord, TrapQ};
use float_cmp::assert_approx_eq;

fn x_trapezoid(tq: &mut TrapQ, print_time: f64, start_x: f64, dir: f64) {
    // 0.1s accel to 50mm/s, 0.2s cruise, 0.1s decel: 15mm
    tq.append(
        print_time,
        0.1,
        0.2,
        0.1,
        Coord::new(start_x, 0.0, 0.0),
        Coord::new(dir, 0.0, 0.0),
        0.0,
        50.0,
        500.0,
    );
}

#[test]
fn test_trapq_positions_through_moves() {
    let mut tq = TrapQ::new();
    x_trapezoid(&mut tq, 1.0, 0.0, 1.0);
    x_trapezoid(&mut tq, 2.0, 15.0, -1.0);

    let at = |tq: &TrapQ, t: f64| tq.position_at(t).unwrap().x;
    assert_approx_eq!(f64, at(&tq, 1.1), 2.5, epsilon = 1e-9);
    assert_approx_eq!(f64, at(&tq, 1.3), 12.5, epsilon = 1e-9);
    // Idle between the two moves
    assert_approx_eq!(f64, at(&tq, 1.7), 15.0, epsilon = 1e-9);
    assert_approx_eq!(f64, at(&tq, 2.05), 15.0 - 0.625, epsilon = 1e-9);
    assert_approx_eq!(f64, at(&tq, 5.0), 0.0, epsilon = 1e-9);
}

#[test]
fn test_trapq_finalize_keeps_history_lookups() {
    let mut tq = TrapQ::new();
    x_trapezoid(&mut tq, 1.0, 0.0, 1.0);
    x_trapezoid(&mut tq, 2.0, 15.0, -1.0);
    tq.finalize_moves(1.5, 0.0);
    // Only the second trapezoid is still live
    assert_eq!(tq.len(), 2 + 1 + 3);
    assert_eq!(tq.history().count(), 3);
    assert_approx_eq!(f64, tq.position_at(1.2).unwrap().x, 7.5, epsilon = 1e-9);

    let old = tq.extract_old(10, 0.0, 1.5);
    assert_eq!(old.len(), 3);
    assert!(old.windows(2).all(|w| w[0].print_time > w[1].print_time));
    assert_approx_eq!(f64, old[2].accel, 500.0);
    assert_approx_eq!(f64, old[0].accel, -500.0);

    tq.finalize_moves(10.0, 1.45);
    assert!(tq.is_empty());
    // Segments of the second move end after the clear time
    assert_eq!(tq.history().count(), 3);
}

#[test]
fn test_trapq_set_position_marks_history() {
    let mut tq = TrapQ::new();
    x_trapezoid(&mut tq, 1.0, 0.0, 1.0);
    tq.set_position(1.2, Coord::new(40.0, 5.0, 0.0));
    assert!(tq.is_empty());
    let pos = tq.position_at(3.0).unwrap();
    assert_approx_eq!(f64, pos.x, 40.0);
    assert_approx_eq!(f64, pos.y, 5.0);
    // Before the marker the interrupted move still answers
    assert_approx_eq!(f64, tq.position_at(1.1).unwrap().x, 2.5, epsilon = 1e-9);
}
