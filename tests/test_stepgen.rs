use chelper::itersolve::StepperKinematics;
use chelper::kinematics::CartesianStepper;
use chelper::stepcompress::{CompressMode, StepCompress};
use chelper::trapq::{Coord, TrapQ};

const MCU_FREQ: f64 = 16_000_000.0;
const STEP_DIST: f64 = 0.01;

fn new_stepper(mode: CompressMode) -> (StepperKinematics, StepCompress) {
    let sk = StepperKinematics::new(Box::new(CartesianStepper::new('x').unwrap()), STEP_DIST);
    let mut sc = StepCompress::new(0, mode);
    sc.fill((0.000025 * MCU_FREQ) as u32, 20, 21);
    sc.set_time(0.0, MCU_FREQ);
    (sk, sc)
}

fn flush_all(sk: &mut StepperKinematics, sc: &mut StepCompress, tq: &TrapQ, flush_time: f64) {
    sk.generate_steps(tq, sc, flush_time).unwrap();
    sc.flush(u64::MAX).unwrap();
}

// Queue a symmetric trapezoid covering `dist` (signed) along x
fn queue_x_move(tq: &mut TrapQ, print_time: f64, start_x: f64, dist: f64, max_v: f64, accel: f64) -> f64 {
    let len = dist.abs();
    let mut cruise_v = max_v;
    let mut accel_t = cruise_v / accel;
    let mut cruise_t = (len - cruise_v * accel_t) / cruise_v;
    if cruise_t < 0.0 {
        cruise_v = (len * accel).sqrt();
        accel_t = cruise_v / accel;
        cruise_t = 0.0;
    }
    let axes_r = Coord::new(dist.signum(), 0.0, 0.0);
    tq.append(
        print_time,
        accel_t,
        cruise_t,
        accel_t,
        Coord::new(start_x, 0.0, 0.0),
        axes_r,
        0.0,
        cruise_v,
        accel,
    );
    print_time + 2.0 * accel_t + cruise_t
}

#[test]
fn test_trapezoid_step_count() {
    for mode in [CompressMode::Standard, CompressMode::HighPrecision] {
        let mut tq = TrapQ::new();
        let (mut sk, mut sc) = new_stepper(mode);
        let end = queue_x_move(&mut tq, 1.0, 0.0, 15.0, 50.0, 500.0);
        flush_all(&mut sk, &mut sc, &tq, end + 0.1);

        let pos = sc.last_position();
        assert!((pos - 1500).abs() <= 1, "{:?}: {} steps", mode, pos);
        let history = sc.extract_old(usize::MAX, 0, u64::MAX);
        assert_eq!(history.iter().map(|h| h.step_count as i64).sum::<i64>(), pos);
        assert_eq!(sc.find_past_position(0), 0);
        assert_eq!(sc.find_past_position(u64::MAX), pos);
        // Halfway through the cruise the axis is at 7.5mm
        let mid = sc.find_past_position((1.2 * MCU_FREQ) as u64);
        assert!((mid - 750).abs() <= 2, "{:?}: {} steps at 1.2s", mode, mid);
    }
}

// accel_t=0.1 cruise_t=0.2 decel_t=0.1 accel=1000 cruise_v=50 from rest.
// The accel phase ends at 100mm/s while the decel phase starts from 50mm/s,
// so deceleration crosses zero halfway and the axis backs up 1.25mm. The
// net distance is still 15mm.
#[test]
fn test_decel_past_zero_keeps_net_count() {
    for mode in [CompressMode::Standard, CompressMode::HighPrecision] {
        let mut tq = TrapQ::new();
        let (mut sk, mut sc) = new_stepper(mode);
        tq.append(
            1.0,
            0.1,
            0.2,
            0.1,
            Coord::new(0.0, 0.0, 0.0),
            Coord::new(1.0, 0.0, 0.0),
            0.0,
            50.0,
            1000.0,
        );
        flush_all(&mut sk, &mut sc, &tq, 1.5);

        let pos = sc.last_position();
        assert!((pos - 1500).abs() <= 1, "{:?}: {} steps", mode, pos);
        let history = sc.extract_old(usize::MAX, 0, u64::MAX);
        let emitted: i64 = history.iter().map(|h| (h.step_count as i64).abs()).sum();
        // 500 accel + 1000 cruise + 125 forward and 125 back while decelerating
        assert!((emitted - 1750).abs() <= 2, "{:?}: {} steps emitted", mode, emitted);
        let peak = sc.find_past_position((1.35 * MCU_FREQ) as u64);
        assert!((peak - 1625).abs() <= 2, "{:?}: {} steps at the turnaround", mode, peak);
    }
}

#[test]
fn test_flush_in_pieces_matches_single_flush() {
    let mut tq = TrapQ::new();
    let end = queue_x_move(&mut tq, 0.5, 0.0, 12.0, 80.0, 2000.0);
    let (mut sk1, mut sc1) = new_stepper(CompressMode::Standard);
    flush_all(&mut sk1, &mut sc1, &tq, end);

    let (mut sk2, mut sc2) = new_stepper(CompressMode::Standard);
    let mut t = 0.5;
    while t < end {
        t = (t + 0.013).min(end);
        sk2.generate_steps(&tq, &mut sc2, t).unwrap();
        sc2.flush((t * MCU_FREQ) as u64).unwrap();
    }
    sc2.flush(u64::MAX).unwrap();
    assert_eq!(sc1.last_position(), sc2.last_position());
    // Runs are cut differently, so the final clock may land anywhere in its error window
    assert!(sc1.last_step_clock().abs_diff(sc2.last_step_clock()) <= 400);
}

#[test]
fn test_random_moves_reach_commanded_position() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    for _ in 0..8 {
        let mut tq = TrapQ::new();
        let (mut sk, mut sc) = new_stepper(CompressMode::Standard);
        let mut print_time = 1.0;
        let mut x = 0.0;
        for _ in 0..12 {
            let dist = (rng.f64() * 20.0 + 0.5) * if rng.bool() { 1.0 } else { -1.0 };
            let max_v = 10.0 + rng.f64() * 90.0;
            let accel = 1000.0 + rng.f64() * 4000.0;
            let end = queue_x_move(&mut tq, print_time, x, dist, max_v, accel);
            x += dist;
            print_time = end + rng.f64() * 0.05;
            let flush_time = print_time - 0.1;
            sk.generate_steps(&tq, &mut sc, flush_time).unwrap();
            sc.flush((flush_time * MCU_FREQ) as u64).unwrap();
            tq.finalize_moves(flush_time, 0.0);
        }
        flush_all(&mut sk, &mut sc, &tq, print_time + 0.1);

        let want = (x / STEP_DIST).round() as i64;
        assert!((sc.last_position() - want).abs() <= 1, "{} steps, want {}", sc.last_position(), want);
        let history = sc.extract_old(usize::MAX, 0, u64::MAX);
        assert!(history.windows(2).all(|w| w[0].first_clock >= w[1].last_clock));
    }
}
