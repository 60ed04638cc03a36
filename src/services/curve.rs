//! Bounded two-parameter exponential-decay fit, `y ≈ a · exp(−b · x)`.
//!
//! Levenberg–Marquardt with the analytic Jacobian, normal equations solved
//! directly (2×2). Parameters are projected back into bounds after every
//! step: `a > 0`, `0 < b ≤ 1`. Small enough to avoid dragging a numerics
//! framework into the binary.

const MAX_ITERS: usize = 5_000;
const A_MIN: f64 = 1e-9;
const B_MIN: f64 = 1e-6;
const B_MAX: f64 = 1.0;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e12;
const COST_TOL: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct DecayFit {
    pub a: f64,
    pub b: f64,
}

impl DecayFit {
    pub fn expected(&self, distance: f64) -> f64 {
        self.a * (-self.b * distance).exp()
    }
}

fn cost(xs: &[f64], ys: &[f64], a: f64, b: f64) -> f64 {
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = y - a * (-b * x).exp();
            r * r
        })
        .sum()
}

/// Fits the decay curve; initial guess is `a = ys[0]`, `b = 0.1`.
/// Returns `None` when the input is too small or the solver cannot make the
/// problem converge to finite in-bounds parameters.
pub fn fit_exp_decay(xs: &[f64], ys: &[f64]) -> Option<DecayFit> {
    if xs.len() != ys.len() || xs.len() < 3 {
        return None;
    }
    if ys.iter().chain(xs).any(|v| !v.is_finite()) {
        return None;
    }

    let mut a = ys[0].max(A_MIN);
    let mut b: f64 = 0.1;
    let mut lambda = LAMBDA_INIT;
    let mut c = cost(xs, ys, a, b);

    for _ in 0..MAX_ITERS {
        // residual r = y - a e^{-bx}; dr/da = -e^{-bx}, dr/db = a x e^{-bx}
        let (mut m00, mut m01, mut m11) = (0.0, 0.0, 0.0);
        let (mut g0, mut g1) = (0.0, 0.0);
        for (&x, &y) in xs.iter().zip(ys) {
            let e = (-b * x).exp();
            let r = y - a * e;
            let ja = -e;
            let jb = a * x * e;
            m00 += ja * ja;
            m01 += ja * jb;
            m11 += jb * jb;
            g0 += ja * r;
            g1 += jb * r;
        }

        // (JᵗJ + λ·diag(JᵗJ)) δ = -Jᵗ r
        let d00 = m00 * (1.0 + lambda);
        let d11 = m11 * (1.0 + lambda);
        let det = d00 * d11 - m01 * m01;
        if det.abs() < f64::MIN_POSITIVE || !det.is_finite() {
            return None;
        }
        let da = (-g0 * d11 + g1 * m01) / det;
        let db = (-g1 * d00 + g0 * m01) / det;

        let na = (a + da).max(A_MIN);
        let nb = (b + db).clamp(B_MIN, B_MAX);
        let nc = cost(xs, ys, na, nb);

        if nc.is_finite() && nc < c {
            let converged = c - nc < COST_TOL;
            a = na;
            b = nb;
            c = nc;
            if converged {
                break;
            }
            lambda = (lambda / 10.0).max(1e-12);
        } else {
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                break;
            }
        }
    }

    if !(a.is_finite() && b.is_finite() && c.is_finite()) {
        return None;
    }
    Some(DecayFit { a, b })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decay_series(a: f64, b: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| a * (-b * x).exp()).collect();
        (xs, ys)
    }

    #[test]
    fn recovers_exact_parameters() {
        let (xs, ys) = decay_series(6.0, 0.2, 10);
        let fit = fit_exp_decay(&xs, &ys).expect("fit");
        assert!((fit.a - 6.0).abs() < 1e-3, "a = {}", fit.a);
        assert!((fit.b - 0.2).abs() < 1e-3, "b = {}", fit.b);
    }

    #[test]
    fn tolerates_one_outlier() {
        let (xs, mut ys) = decay_series(6.0, 0.2, 10);
        ys[5] = 1.40;
        let fit = fit_exp_decay(&xs, &ys).expect("fit");
        // fit stays anchored near the true curve despite the bargain print
        assert!((fit.a - 6.0).abs() < 0.3, "a = {}", fit.a);
        assert!((fit.b - 0.2).abs() < 0.05, "b = {}", fit.b);
        let expected = fit.expected(5.0);
        assert!((2.0..2.35).contains(&expected), "expected(5) = {expected}");
    }

    #[test]
    fn b_respects_upper_bound() {
        // extremely fast decay wants b >> 1; the bound holds it at 1.0
        let xs = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let ys = vec![10.0, 0.1, 0.001, 0.00001, 0.0000001];
        let fit = fit_exp_decay(&xs, &ys).expect("fit");
        assert!(fit.b <= B_MAX + 1e-12);
        assert!(fit.a > 0.0);
    }

    #[test]
    fn flat_series_fits_at_lower_decay_bound() {
        let xs = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = vec![2.5; 6];
        let fit = fit_exp_decay(&xs, &ys).expect("fit");
        assert!(fit.b >= B_MIN);
        assert!(fit.expected(0.0).is_finite());
    }

    #[test]
    fn rejects_degenerate_input() {
        assert!(fit_exp_decay(&[0.0, 1.0], &[1.0, 0.5]).is_none());
        assert!(fit_exp_decay(&[0.0, 1.0, 2.0], &[1.0, f64::NAN, 0.5]).is_none());
        assert!(fit_exp_decay(&[], &[]).is_none());
    }
}
