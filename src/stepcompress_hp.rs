// src/stepcompress_hp.rs
// High precision step compression
//
// A run is described by (interval, count, add, add2, shift). The mcu keeps
// a 64bit fixed point accumulator and for each step does:
//
//     pos += interval; interval += add; add += add2;
//     step_clock = base_clock + (pos >> shift)
//
// so step k fires at floor((k*i + a*k(k-1)/2 + a2*k(k-1)(k-2)/6) / 2^shift)
// ticks after the previous run. Each step may land up to `max_error` ticks
// early or `max_error/2` ticks late, each bound further limited by the
// distance to the neighbouring steps.
//
// Runs are fitted with weighted least squares against the middle of each
// step's window, the coefficients rounded from the highest order down with
// a refit of the lower orders after each rounding, and the result verified
// step by step.

use std::sync::OnceLock;

use crate::stepcompress::{test_step_move, Points, StepMove, MAX_RUN};

const HP_MAX_SHIFT: u32 = 16;
const HP_INTERVAL_BITS: u32 = 30;
const LSQ_CACHE_MAX: usize = 512;
const TRUNCATE_MIN: u32 = 16;
const TRUNCATE_MAX: u32 = 3;

// Step time relative to the last emitted step
fn rel_point(queue: &[u32], idx: usize, lsc: u64) -> i64 {
    queue[idx].wrapping_sub(lsc as u32) as i64
}

/// Allowed window for step `idx` of the pending queue.
pub(crate) fn band(queue: &[u32], idx: usize, lsc: u64, max_error: u32) -> Points {
    let point = rel_point(queue, idx, lsc);
    let prevpoint = if idx > 0 { rel_point(queue, idx - 1, lsc) } else { 0 };
    let back = ((point - prevpoint) / 2).min(max_error as i64);
    let fwd = if idx + 1 < queue.len() {
        let next = rel_point(queue, idx + 1, lsc);
        ((next - point) / 4).min(max_error as i64 / 2)
    } else {
        0
    };
    Points { minp: point - back, maxp: point + fwd }
}

/// LDL' factors of a symmetric 3x3 matrix. The leading 1x1 and 2x2 blocks
/// of the factors factor the leading blocks of the matrix.
#[derive(Debug, Clone, Copy, Default)]
struct Ldl {
    d: [f64; 3],
    l10: f64,
    l20: f64,
    l21: f64,
}

impl Ldl {
    fn factor(g: &[[f64; 3]; 3], dim: usize) -> Option<Self> {
        let mut f = Ldl::default();
        f.d[0] = g[0][0];
        if f.d[0] <= f64::EPSILON {
            return None;
        }
        if dim > 1 {
            f.l10 = g[1][0] / f.d[0];
            f.d[1] = g[1][1] - f.l10 * f.l10 * f.d[0];
            if f.d[1] <= f64::EPSILON * g[1][1] {
                return None;
            }
        }
        if dim > 2 {
            f.l20 = g[2][0] / f.d[0];
            f.l21 = (g[2][1] - f.l20 * f.l10 * f.d[0]) / f.d[1];
            f.d[2] = g[2][2] - f.l20 * f.l20 * f.d[0] - f.l21 * f.l21 * f.d[1];
            if f.d[2] <= f64::EPSILON * g[2][2] {
                return None;
            }
        }
        Some(f)
    }

    // Solve the leading dim x dim system
    fn solve(&self, rhs: [f64; 3], dim: usize) -> [f64; 3] {
        let mut z = rhs;
        if dim > 1 {
            z[1] -= self.l10 * z[0];
        }
        if dim > 2 {
            z[2] -= self.l20 * z[0] + self.l21 * z[1];
        }
        for i in 0..dim {
            z[i] /= self.d[i];
        }
        if dim > 2 {
            z[1] -= self.l21 * z[2];
            z[0] -= self.l20 * z[2];
        }
        if dim > 1 {
            z[0] -= self.l10 * z[1];
        }
        z
    }
}

// Basis functions (interval, add, add2), scaled by powers of the run length
fn basis(k: usize, n: usize) -> [f64; 3] {
    let (k, n) = (k as f64, n as f64);
    [k / n, k * (k - 1.0) / 2.0 / (n * n), k * (k - 1.0) * (k - 2.0) / 6.0 / (n * n * n)]
}

fn gram(n: usize, weights: Option<&[f64]>) -> [[f64; 3]; 3] {
    let mut g = [[0.0; 3]; 3];
    for k in 1..=n {
        let phi = basis(k, n);
        let w = weights.map_or(1.0, |w| w[k - 1]);
        for i in 0..3 {
            for j in 0..=i {
                g[i][j] += w * phi[i] * phi[j];
            }
        }
    }
    for i in 0..3 {
        for j in i + 1..3 {
            g[i][j] = g[j][i];
        }
    }
    g
}

// Factors of the unweighted normal equations, indexed by run length
fn unweighted_factors() -> &'static [Option<Ldl>] {
    static CACHE: OnceLock<Vec<Option<Ldl>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        (0..=LSQ_CACHE_MAX)
            .map(|n| if n < 3 { None } else { Ldl::factor(&gram(n, None), 3) })
            .collect()
    })
}

struct Fitter<'a> {
    queue: &'a [u32],
    lsc: u64,
    max_error: u32,
    bands: Vec<Points>,
}

impl<'a> Fitter<'a> {
    fn new(queue: &'a [u32], lsc: u64, max_error: u32) -> Self {
        Self { queue, lsc, max_error, bands: Vec::new() }
    }

    fn ensure_bands(&mut self, n: usize) {
        while self.bands.len() < n {
            let idx = self.bands.len();
            self.bands.push(band(self.queue, idx, self.lsc, self.max_error));
        }
    }

    fn pick_shift(&self, n: usize) -> u8 {
        let mut max_gap = 1;
        let mut prev = 0;
        for idx in 0..n {
            let point = rel_point(self.queue, idx, self.lsc);
            max_gap = max_gap.max(point - prev);
            prev = point;
        }
        let mut shift = 0;
        while shift < HP_MAX_SHIFT && (max_gap << (shift + 1)) < (1i64 << HP_INTERVAL_BITS) {
            shift += 1;
        }
        shift as u8
    }

    fn single(&self) -> StepMove {
        StepMove::new(rel_point(self.queue, 0, self.lsc) as u32, 1, 0)
    }

    fn try_fit(&mut self, n: usize) -> Option<StepMove> {
        self.ensure_bands(n);
        let shift = self.pick_shift(n);
        let scale = (1u64 << shift) as f64;
        let bands = &self.bands[..n];
        let targets: Vec<f64> =
            bands.iter().map(|b| ((b.minp + b.maxp) as f64 * 0.5 + 0.5) * scale).collect();
        let uniform = bands.iter().all(|b| b.maxp - b.minp == bands[0].maxp - bands[0].minp);
        let weights: Option<Vec<f64>> = if uniform {
            None
        } else {
            Some(bands.iter().map(|b| 1.0 / ((b.maxp - b.minp) as f64 + 1.0).powi(2)).collect())
        };
        let dim = n.min(3);
        let factors = match (&weights, unweighted_factors().get(n)) {
            (None, Some(Some(f))) if dim == 3 => *f,
            _ => Ldl::factor(&gram(n, weights.as_deref()), dim)?,
        };
        let fit = |orders: usize| -> Option<StepMove> {
            let mut resid = targets.clone();
            let mut coef = [0i64; 3];
            for order in (0..orders).rev() {
                let mut rhs = [0.0; 3];
                for (idx, r) in resid.iter().enumerate() {
                    let phi = basis(idx + 1, n);
                    let w = weights.as_ref().map_or(1.0, |w| w[idx]);
                    for j in 0..=order {
                        rhs[j] += w * phi[j] * r;
                    }
                }
                let sol = factors.solve(rhs, order + 1);
                let c = (sol[order] / (n as f64).powi(order as i32 + 1)).round();
                if !c.is_finite() || c.abs() >= i32::MAX as f64 {
                    return None;
                }
                coef[order] = c as i64;
                for (idx, r) in resid.iter_mut().enumerate() {
                    let k = (idx + 1) as f64;
                    let phi = [k, k * (k - 1.0) / 2.0, k * (k - 1.0) * (k - 2.0) / 6.0];
                    *r -= c * phi[order];
                }
            }
            if !(0..0x8000_0000).contains(&coef[0]) {
                return None;
            }
            let mv = StepMove {
                interval: coef[0] as u32,
                count: n as u32,
                add: coef[1] as i32,
                add2: coef[2] as i32,
                shift,
            };
            test_step_move(&mv, |i| bands[i]).ok().map(|_| mv)
        };
        fit(dim).or_else(|| if dim == 3 { fit(2) } else { None })
    }
}

/// Find a run that covers as many of the pending steps as possible.
pub(crate) fn compress(queue: &[u32], lsc: u64, max_error: u32) -> StepMove {
    let total = queue.len().min(MAX_RUN);
    let mut fitter = Fitter::new(queue, lsc, max_error);
    let mut best = fitter.single();
    if total < 2 {
        return best;
    }

    // Exponential search for a failing run length, then bisect
    let (mut lo, mut hi) = (1usize, total + 1);
    let mut n = 2;
    loop {
        let m = n.min(total);
        match fitter.try_fit(m) {
            Some(mv) => {
                best = mv;
                lo = m;
                if m == total {
                    break;
                }
                n *= 2;
            }
            None => {
                hi = m;
                break;
            }
        }
    }
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        match fitter.try_fit(mid) {
            Some(mv) => {
                best = mv;
                lo = mid;
            }
            None => hi = mid,
        }
    }

    // A late final step delays the start of the next run; give back a few
    // steps when that greatly reduces the final step error.
    if best.count > TRUNCATE_MIN {
        let step_err = |k: u32| (best.step_offset(k) - rel_point(queue, k as usize - 1, lsc)).abs();
        let full = step_err(best.count);
        if full * 2 > max_error as i64 {
            if let Some(k) = (best.count - TRUNCATE_MAX..best.count).rev().find(|&k| step_err(k) * 2 <= full) {
                best.count = k;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stepcompress::tests::{fields, replay};
    use crate::stepcompress::{CompressMode, StepCompress};

    fn run(mode: CompressMode, max_error: u32, clocks: &[u64]) -> (StepCompress, usize) {
        let mut sc = StepCompress::new(3, mode);
        sc.fill(max_error, 20, 21);
        sc.set_time(0.0, 1_000_000.0);
        for &c in clocks {
            sc.append(true, 0.0, c as f64 / 1_000_000.0).unwrap();
        }
        sc.flush(u64::MAX).unwrap();
        let steps = sc.msg_queue_mut().iter().filter(|qm| fields(qm)[0] == 20).count();
        (sc, steps)
    }

    fn jerk_clocks(count: usize) -> Vec<u64> {
        let mut clocks = Vec::with_capacity(count);
        let mut t = 0.0;
        for k in 0..count {
            let k = k as f64;
            t += 2000.0 - 3.0 * k + 0.004 * k * k;
            clocks.push(t.round() as u64);
        }
        clocks
    }

    #[test]
    fn band_is_asymmetric() {
        let q = [1000u32, 2000, 3000];
        assert_eq!(band(&q, 0, 0, 100), Points { minp: 900, maxp: 1050 });
        assert_eq!(band(&q, 1, 0, 1000), Points { minp: 1500, maxp: 2250 });
        // last queued step may not be late
        assert_eq!(band(&q, 2, 0, 100), Points { minp: 2900, maxp: 3000 });
    }

    #[test]
    fn ldl_solves_leading_blocks() {
        let g = [[4.0, 2.0, 0.4], [2.0, 2.0, 0.5], [0.4, 0.5, 1.0]];
        let f = Ldl::factor(&g, 3).unwrap();
        let x = [1.0, -2.0, 3.0];
        let rhs = |dim: usize| {
            let mut b = [0.0; 3];
            for i in 0..dim {
                for j in 0..dim {
                    b[i] += g[i][j] * x[j];
                }
            }
            b
        };
        for dim in 1..=3 {
            let sol = f.solve(rhs(dim), dim);
            for i in 0..dim {
                assert!((sol[i] - x[i]).abs() < 1e-9, "dim {} idx {}", dim, i);
            }
        }
    }

    #[test]
    fn cached_factors_match_direct() {
        let cached = unweighted_factors()[40].unwrap();
        let direct = Ldl::factor(&gram(40, None), 3).unwrap();
        for i in 0..3 {
            assert!((cached.d[i] - direct.d[i]).abs() < 1e-12);
        }
        assert!(unweighted_factors()[2].is_none());
    }

    #[test]
    fn constant_rate_with_fraction() {
        let clocks: Vec<u64> = (1..=2000u64).map(|k| k * 12345 / 10).collect();
        let (mut sc, steps) = run(CompressMode::HighPrecision, 20, &clocks);
        assert!(steps <= 2, "{} commands", steps);
        let got = replay(&mut sc, 0);
        assert_eq!(got.len(), clocks.len());
        for (g, c) in got.iter().zip(clocks.iter()) {
            assert!(*g + 20 >= *c && *g <= *c + 10, "step {} vs {}", g, c);
        }
    }

    #[test]
    fn jerk_profile_beats_standard() {
        let clocks = jerk_clocks(1000);
        let (mut sc, hp_steps) = run(CompressMode::HighPrecision, 25, &clocks);
        let (_, std_steps) = run(CompressMode::Standard, 25, &clocks);
        assert!(hp_steps < std_steps, "hp {} std {}", hp_steps, std_steps);
        let got = replay(&mut sc, 0);
        assert_eq!(got.len(), clocks.len());
        for (g, c) in got.iter().zip(clocks.iter()) {
            assert!(*g + 25 >= *c && *g <= *c + 12, "step {} vs {}", g, c);
        }
    }

    #[test]
    fn hp_message_layout() {
        let clocks: Vec<u64> = (1..=10u64).map(|k| k * 1000).collect();
        let (mut sc, _) = run(CompressMode::HighPrecision, 10, &clocks);
        let msgs: Vec<Vec<i64>> = sc.msg_queue_mut().iter().map(fields).collect();
        assert_eq!(msgs[0], vec![21, 3, 1]);
        assert_eq!(msgs[1].len(), 7);
        assert_eq!(msgs[1][3], 10);
        assert_eq!(sc.last_position(), 10);
    }

    #[test]
    fn single_step_is_exact() {
        let q = [777u32];
        let mv = compress(&q, 0, 10);
        assert_eq!(mv, StepMove::new(777, 1, 0));
    }
}
