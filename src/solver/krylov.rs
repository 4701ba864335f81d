//! Restarted GMRES backend for the matrix-free and distributed variants.
//!
//! Left-preconditioned GMRES with fixed restart (Saad §6.4): modified
//! Gram-Schmidt with one refinement sweep, Givens rotations for the
//! least-squares update, happy-breakdown detection, and zero-pivot
//! protection in the back-substitution. Operator and preconditioner
//! application are fallible so matrix-free callback errors propagate
//! unchanged, and every reduction goes through the communicator so the same
//! code path is correct serially and under MPI.

use crate::error::LsError;
use crate::parallel::Comm;
use crate::utils::convergence::{Convergence, SolveStats, StopReason};

/// Fallible `y ← L v` used for both the operator and the preconditioner.
pub(crate) type ApplyFn<'a> = &'a dyn Fn(&[f64], &mut [f64]) -> Result<(), LsError>;

/// Solve A·x = b iteratively, using `x` as the initial guess. Non-convergence
/// is reported through the returned stats, never as an error; `x` holds the
/// best available iterate either way.
pub(crate) fn gmres(
    op: ApplyFn,
    pc: Option<ApplyFn>,
    comm: &dyn Comm,
    b: &[f64],
    x: &mut [f64],
    conv: &Convergence,
    restart: usize,
) -> Result<SolveStats, LsError> {
    let n = b.len();
    assert_eq!(x.len(), n, "rhs and solution lengths differ");
    let restart = restart.max(1).min(conv.itermax.max(1));

    let precondition = |r: &[f64], z: &mut [f64]| -> Result<(), LsError> {
        match pc {
            Some(m) => m(r, z),
            None => {
                z.copy_from_slice(r);
                Ok(())
            }
        }
    };

    // z0 = M⁻¹ (b - A x)
    let mut ax = vec![0.0; n];
    op(x, &mut ax)?;
    let mut r = vec![0.0; n];
    for i in 0..n {
        r[i] = b[i] - ax[i];
    }
    let mut z = vec![0.0; n];
    precondition(&r, &mut z)?;
    let mut beta = comm.norm(&z);
    let res0 = beta;
    if beta == 0.0 {
        return Ok(conv.stats(0.0, 0, StopReason::ConvergedAtol));
    }
    let breakdown = f64::EPSILON * (res0 + 1.0);

    let mut total_iters = 0usize;
    loop {
        // Arnoldi basis for this restart cycle
        let mut v: Vec<Vec<f64>> = Vec::with_capacity(restart + 1);
        v.push(z.iter().map(|zi| zi / beta).collect());
        let mut h = vec![vec![0.0; restart]; restart + 1];
        let mut cs = vec![0.0; restart];
        let mut sn = vec![0.0; restart];
        let mut g = vec![0.0; restart + 1];
        g[0] = beta;

        let mut cycle_cols = 0usize;
        let mut stop: Option<StopReason> = None;

        for j in 0..restart {
            // w = M⁻¹ A v_j
            op(&v[j], &mut ax)?;
            let mut w = vec![0.0; n];
            precondition(&ax, &mut w)?;

            // modified Gram-Schmidt with one refinement sweep
            for i in 0..=j {
                h[i][j] = comm.dot(&w, &v[i]);
                for (wk, vik) in w.iter_mut().zip(v[i].iter()) {
                    *wk -= h[i][j] * *vik;
                }
            }
            for i in 0..=j {
                let t = comm.dot(&w, &v[i]);
                h[i][j] += t;
                for (wk, vik) in w.iter_mut().zip(v[i].iter()) {
                    *wk -= t * *vik;
                }
            }
            h[j + 1][j] = comm.norm(&w);
            let happy = h[j + 1][j] <= breakdown;
            if !happy {
                v.push(w.iter().map(|wi| wi / h[j + 1][j]).collect());
            }

            // previous Givens rotations applied to the new column
            for i in 0..j {
                let t = cs[i] * h[i][j] + sn[i] * h[i + 1][j];
                h[i + 1][j] = -sn[i] * h[i][j] + cs[i] * h[i + 1][j];
                h[i][j] = t;
            }
            let (c, s) = givens(h[j][j], h[j + 1][j]);
            cs[j] = c;
            sn[j] = s;
            h[j][j] = c * h[j][j] + s * h[j + 1][j];
            h[j + 1][j] = 0.0;
            g[j + 1] = -s * g[j];
            g[j] *= c;

            total_iters += 1;
            cycle_cols = j + 1;
            let res = g[j + 1].abs();
            stop = conv.check(res, res0, total_iters);
            if happy && stop.is_none() {
                stop = Some(StopReason::ConvergedRtol);
            }
            if stop.is_some() {
                break;
            }
        }

        // x ← x + V y with H y = g
        let y = solve_upper(&h, &g, cycle_cols);
        for (j, yj) in y.iter().enumerate() {
            for i in 0..n {
                x[i] += yj * v[j][i];
            }
        }

        if let Some(reason) = stop {
            let res = g[cycle_cols].abs();
            return Ok(conv.stats(res, total_iters, reason));
        }

        // restart from the true residual
        op(x, &mut ax)?;
        for i in 0..n {
            r[i] = b[i] - ax[i];
        }
        precondition(&r, &mut z)?;
        beta = comm.norm(&z);
        if let Some(reason) = conv.check(beta, res0, total_iters) {
            return Ok(conv.stats(beta, total_iters, reason));
        }
    }
}

/// Plane rotation annihilating `b` in (a, b).
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if a.abs() < b.abs() {
        let t = a / b;
        let s = 1.0 / (1.0 + t * t).sqrt();
        (s * t, s)
    } else {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, c * t)
    }
}

/// Back-substitution on the rotated Hessenberg system, with zero-pivot
/// protection.
fn solve_upper(h: &[Vec<f64>], g: &[f64], k: usize) -> Vec<f64> {
    let mut y = vec![0.0; k];
    for i in (0..k).rev() {
        let mut sum = g[i];
        for j in (i + 1)..k {
            sum -= h[i][j] * y[j];
        }
        y[i] = if h[i][i].abs() > f64::EPSILON { sum / h[i][i] } else { 0.0 };
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialComm;

    #[test]
    fn gmres_solves_diagonal_system() {
        let d = [2.0, 4.0, 8.0];
        let op = |x: &[f64], y: &mut [f64]| -> Result<(), LsError> {
            for i in 0..3 {
                y[i] = d[i] * x[i];
            }
            Ok(())
        };
        let conv = Convergence { reltol: 1e-12, abstol: 1e-30, dtol: 1e5, itermax: 50 };
        let b = vec![2.0, 4.0, 8.0];
        let mut x = vec![0.0; 3];
        let stats = gmres(&op, None, &SerialComm, &b, &mut x, &conv, 10).unwrap();
        assert!(stats.converged);
        for xi in &x {
            assert!((xi - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn apply_errors_propagate() {
        let op = |_x: &[f64], _y: &mut [f64]| -> Result<(), LsError> {
            Err(LsError::ApplyError("callback failed".into()))
        };
        let conv = Convergence { reltol: 1e-8, abstol: 1e-14, dtol: 1e5, itermax: 10 };
        let b = vec![1.0, 1.0];
        let mut x = vec![0.0; 2];
        let err = gmres(&op, None, &SerialComm, &b, &mut x, &conv, 5).unwrap_err();
        assert!(matches!(err, LsError::ApplyError(_)));
    }
}
