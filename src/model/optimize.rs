//! # One-Dimensional Optimisation
//!
//! Brent's method (parabolic interpolation with golden-section fallback) for
//! maximising a function of one branch length on a bounded interval.

use crate::error::Result;

/// `(3 - sqrt(5)) / 2`
const CGOLD: f64 = 0.381_966_011_250_105_1;
const ZEPS: f64 = 1e-10;

/// Lower bound of an optimised branch length
pub const MIN_BRANCH_LENGTH: f64 = 1e-6;
/// Upper bound of an optimised branch length
pub const MAX_BRANCH_LENGTH: f64 = 100.0;

/// Maximise `f` on `[lo, hi]` starting from `start`.
///
/// Returns `(x, f(x))` for the best point evaluated. `start` is always
/// evaluated first, so the result is never worse than the starting point.
pub fn brent_maximize<F>(
    mut f: F,
    lo: f64,
    hi: f64,
    start: f64,
    tol: f64,
    max_iter: usize,
) -> Result<(f64, f64)>
where
    F: FnMut(f64) -> Result<f64>,
{
    let (mut a, mut b) = (lo.min(hi), lo.max(hi));
    let mut x = start.clamp(a, b);
    let mut w = x;
    let mut v = x;
    // Minimise the negated function
    let mut fx = -f(x)?;
    let mut fw = fx;
    let mut fv = fx;
    let mut d: f64 = 0.0;
    let mut e: f64 = 0.0;

    for _ in 0..max_iter {
        let xm = 0.5 * (a + b);
        let tol1 = tol * x.abs() + ZEPS;
        let tol2 = 2.0 * tol1;
        if (x - xm).abs() <= tol2 - 0.5 * (b - a) {
            break;
        }

        if e.abs() > tol1 {
            let r = (x - w) * (fx - fv);
            let mut q = (x - v) * (fx - fw);
            let mut p = (x - v) * q - (x - w) * r;
            q = 2.0 * (q - r);
            if q > 0.0 {
                p = -p;
            } else {
                q = -q;
            }
            let etemp = e;
            e = d;
            if p.abs() >= (0.5 * q * etemp).abs() || p <= q * (a - x) || p >= q * (b - x) {
                e = if x >= xm { a - x } else { b - x };
                d = CGOLD * e;
            } else {
                d = p / q;
                let u = x + d;
                if u - a < tol2 || b - u < tol2 {
                    d = tol1.copysign(xm - x);
                }
            }
        } else {
            e = if x >= xm { a - x } else { b - x };
            d = CGOLD * e;
        }

        let u = if d.abs() >= tol1 {
            x + d
        } else {
            x + tol1.copysign(d)
        }
        .clamp(a, b);
        let fu = -f(u)?;

        if fu <= fx {
            if u >= x {
                a = x;
            } else {
                b = x;
            }
            v = w;
            fv = fw;
            w = x;
            fw = fx;
            x = u;
            fx = fu;
        } else {
            if u < x {
                a = u;
            } else {
                b = u;
            }
            if fu <= fw || w == x {
                v = w;
                fv = fw;
                w = u;
                fw = fu;
            } else if fu <= fv || v == x || v == w {
                v = u;
                fv = fu;
            }
        }
    }

    Ok((x, -fx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parabola() {
        let (x, fx) = brent_maximize(|x| Ok(-(x - 2.0) * (x - 2.0)), 0.0, 10.0, 5.0, 1e-8, 200).unwrap();
        assert!((x - 2.0).abs() < 1e-5, "{}", x);
        assert!(fx.abs() < 1e-9);
    }

    #[test]
    fn test_log_likelihood_shape() {
        // ln(x) - x peaks at x = 1
        let (x, _) = brent_maximize(|x| Ok(x.ln() - x), 1e-6, 100.0, 0.1, 1e-8, 200).unwrap();
        assert!((x - 1.0).abs() < 1e-4, "{}", x);
    }

    #[test]
    fn test_boundary_optimum_stays_in_range() {
        let (x, _) = brent_maximize(|x| Ok(-x), 1e-6, 100.0, 0.5, 1e-8, 200).unwrap();
        assert!(x >= 1e-6 && x < 1e-3, "{}", x);
    }

    #[test]
    fn test_never_worse_than_start() {
        let f = |x: f64| Ok((3.0 * x).sin());
        let start = 0.5;
        let (_, fx) = brent_maximize(f, 0.0, 10.0, start, 1e-8, 5).unwrap();
        assert!(fx >= (3.0 * start).sin());
    }

    #[test]
    fn test_errors_propagate() {
        let result = brent_maximize(
            |_| Err(crate::error::EpaError::numerical("boom")),
            0.0,
            1.0,
            0.5,
            1e-8,
            10,
        );
        assert!(result.is_err());
    }
}
