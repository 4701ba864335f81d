//! The linear solver: one preconditioner, one operator, one contract.
//!
//! `LinearSolver` owns exactly one [`Preconditioner`] and one
//! [`LinearOperator`] and decides when each is recomputed, when distributed
//! data is staged, and which backend a solve dispatches to. Recomputation is
//! idempotent: a `calc_*` call on an already set-up object touches no
//! counters. Solves never recompute the matrix; they use whatever state the
//! last `calc_*` produced, even if the caller's data has moved on. That
//! staleness is part of the contract.

pub mod krylov;

use crate::config::SolverOptions;
use crate::context::SystemContext;
use crate::error::LsError;
use crate::operator::LinearOperator;
use crate::parallel::{Comm, ParallelStaging, SerialComm};
use crate::preconditioner::Preconditioner;
use crate::utils::convergence::SolveStats;
use std::rc::Rc;

pub struct LinearSolver<C: Comm = SerialComm> {
    pc: Preconditioner,
    lo: LinearOperator,
    staging: Option<Box<dyn ParallelStaging>>,
    opts: SolverOptions,
    comm: C,
    rank: usize,
    shared_mat: bool,
    is_finalized: bool,
}

impl LinearSolver<SerialComm> {
    /// Single-process solver.
    pub fn new(
        pc: Preconditioner,
        lo: LinearOperator,
        opts: SolverOptions,
    ) -> Result<Self, LsError> {
        Self::with_comm(pc, lo, opts, SerialComm)
    }
}

impl<C: Comm> LinearSolver<C> {
    pub fn with_comm(
        pc: Preconditioner,
        lo: LinearOperator,
        opts: SolverOptions,
        comm: C,
    ) -> Result<Self, LsError> {
        let aliased = match (pc.matrix(), lo.matrix()) {
            (Some(p), Some(l)) => Rc::ptr_eq(p, l),
            _ => false,
        };
        if opts.shared_mat && pc.is_none() {
            return Err(LsError::InvariantViolation(
                "shared_mat set with a None preconditioner",
            ));
        }
        if opts.shared_mat && !aliased {
            return Err(LsError::InvariantViolation(
                "shared_mat set but preconditioner and operator hold distinct matrices",
            ));
        }
        if !opts.shared_mat && aliased {
            return Err(LsError::InvariantViolation(
                "preconditioner and operator alias one matrix without shared_mat",
            ));
        }
        let rank = comm.rank();
        let shared_mat = opts.shared_mat;
        Ok(LinearSolver {
            pc,
            lo,
            staging: None,
            opts,
            comm,
            rank,
            shared_mat,
            is_finalized: false,
        })
    }

    /// Attach the halo-exchange collaborator used when a solver object
    /// declares it needs staged distributed data.
    pub fn with_staging(mut self, staging: Box<dyn ParallelStaging>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn pc(&self) -> &Preconditioner {
        &self.pc
    }

    pub fn lo(&self) -> &LinearOperator {
        &self.lo
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_finalized(&self) -> bool {
        self.is_finalized
    }

    pub fn options(&self) -> &SolverOptions {
        &self.opts
    }

    fn ensure_live(&self) -> Result<(), LsError> {
        if self.is_finalized { Err(LsError::Finalized) } else { Ok(()) }
    }

    fn stage(&mut self, wait: bool) -> Result<(), LsError> {
        match self.staging.as_mut() {
            Some(s) => s.stage(wait),
            None => Err(LsError::InvariantViolation(
                "parallel data staging requested but no staging collaborator is attached",
            )),
        }
    }

    /// Recompute the preconditioner for the caller's current iterate. A
    /// `None` preconditioner delegates entirely to the operator: a direct
    /// solve has no separate preconditioner, the operator itself is what
    /// gets factorized. With `start_comm`, staging runs (blocking) first
    /// when the preconditioner needs distributed data.
    pub fn calc_pc(
        &mut self,
        ctx: &mut dyn SystemContext,
        start_comm: bool,
    ) -> Result<(), LsError> {
        self.ensure_live()?;
        if self.pc.is_none() {
            return self.calc_linear_operator(ctx, start_comm);
        }
        if start_comm && self.pc.needs_parallel_data() {
            self.stage(true)?;
        }
        if !self.pc.is_setup() {
            self.pc.compute(ctx)?;
        }
        Ok(())
    }

    /// Recompute the operator for the caller's current iterate, regardless
    /// of the preconditioner variant.
    pub fn calc_linear_operator(
        &mut self,
        ctx: &mut dyn SystemContext,
        start_comm: bool,
    ) -> Result<(), LsError> {
        self.ensure_live()?;
        if start_comm && self.lo.needs_parallel_data() {
            self.stage(true)?;
        }
        if !self.lo.is_setup() {
            self.lo.compute(ctx)?;
        }
        Ok(())
    }

    /// Recompute both objects without duplicating work when they share a
    /// matrix. Staging here is eager and blocking: one exchange up front,
    /// because interleaving staging with the later per-object computes is
    /// not supported.
    pub fn calc_pc_and_lo(
        &mut self,
        ctx: &mut dyn SystemContext,
        start_comm: bool,
    ) -> Result<(), LsError> {
        self.ensure_live()?;
        if start_comm && (self.pc.needs_parallel_data() || self.lo.needs_parallel_data()) {
            self.stage(true)?;
        }
        if self.pc.is_none() {
            if !self.lo.is_setup() {
                self.lo.compute(ctx)?;
            }
            return Ok(());
        }
        if self.shared_mat {
            if !self.lo.is_setup() {
                self.lo.compute(ctx)?;
            }
            // Invariant repair: the shared matrix is fresh, so the
            // preconditioner is set up even though its compute was skipped.
            self.pc.mark_setup();
            return Ok(());
        }
        if !self.pc.is_setup() {
            self.pc.compute(ctx)?;
        }
        if !self.lo.is_setup() {
            self.lo.compute(ctx)?;
        }
        Ok(())
    }

    /// z = M⁻¹ r. A `None` preconditioner degenerates to an exact solve.
    pub fn apply_pc(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
        self.ensure_live()?;
        if self.pc.is_none() {
            self.solve(r, z).map(|_| ())
        } else {
            self.pc.apply(r, z)
        }
    }

    /// z = M⁻ᵀ r.
    pub fn apply_pc_transpose(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
        self.ensure_live()?;
        if self.pc.is_none() {
            self.solve_transpose(r, z).map(|_| ())
        } else {
            self.pc.apply_transpose(r, z)
        }
    }

    /// Solve A·x = b with the most recently computed operator state.
    pub fn solve(&mut self, b: &[f64], x: &mut [f64]) -> Result<SolveStats, LsError> {
        self.ensure_live()?;
        self.solve_inner(b, x, false)
    }

    /// Solve Aᵀ·x = b with the most recently computed operator state.
    pub fn solve_transpose(&mut self, b: &[f64], x: &mut [f64]) -> Result<SolveStats, LsError> {
        self.ensure_live()?;
        self.solve_inner(b, x, true)
    }

    fn solve_inner(
        &mut self,
        b: &[f64],
        x: &mut [f64],
        transpose: bool,
    ) -> Result<SolveStats, LsError> {
        if self.lo.matrix().is_some() && self.lo.assembly_count() == 0 {
            return Err(LsError::InvariantViolation(
                "solve before the operator matrix was ever computed",
            ));
        }
        if self.lo.is_iterative() {
            self.solve_iterative(b, x, transpose)
        } else {
            self.lo.prepare_factor(self.opts.symbolic_refactor_always)?;
            self.lo.back_substitute(b, x, transpose)?;
            if transpose {
                self.lo.transpose_solve_count += 1;
            } else {
                self.lo.solve_count += 1;
            }
            Ok(SolveStats::direct())
        }
    }

    fn solve_iterative(
        &mut self,
        b: &[f64],
        x: &mut [f64],
        transpose: bool,
    ) -> Result<SolveStats, LsError> {
        if self.lo.is_distributed() {
            self.stage_distributed(b)?;
        }

        let mut x_work = x.to_vec();
        let conv = self.opts.tolerances.as_convergence();
        let restart = self.opts.restart;
        let stats = {
            let lo = &self.lo;
            let pc = &self.pc;
            let op_forward = |v: &[f64], y: &mut [f64]| lo.apply(v, y);
            let op_adjoint = |v: &[f64], y: &mut [f64]| lo.apply_transpose(v, y);
            let op: krylov::ApplyFn = if transpose { &op_adjoint } else { &op_forward };
            let pc_forward = |r: &[f64], z: &mut [f64]| pc.apply(r, z);
            let pc_adjoint = |r: &[f64], z: &mut [f64]| pc.apply_transpose(r, z);
            let pc_apply: Option<krylov::ApplyFn> = if pc.is_none() {
                None
            } else if transpose {
                Some(&pc_adjoint)
            } else {
                Some(&pc_forward)
            };
            let rhs = lo.staged_rhs().unwrap_or(b);
            krylov::gmres(op, pc_apply, &self.comm, rhs, &mut x_work, &conv, restart)?
        };

        if let Some((_, sol)) = self.lo.staging_buffers() {
            sol.copy_from_slice(&x_work);
        }
        x.copy_from_slice(&x_work);
        if transpose {
            self.lo.transpose_solve_count += 1;
        } else {
            self.lo.solve_count += 1;
        }

        if stats.converged {
            log::debug!(
                "rank {}: iterative solve stopped with {:?} after {} iterations, residual {:.3e}",
                self.rank,
                stats.reason,
                stats.iterations,
                stats.final_residual
            );
        } else {
            log::warn!(
                "rank {}: iterative solve did not converge ({:?}) after {} iterations, residual {:.3e}",
                self.rank,
                stats.reason,
                stats.iterations,
                stats.final_residual
            );
        }
        Ok(stats)
    }

    /// Copy the caller's local right-hand side into the distributed staging
    /// vector and complete any pending matrix assembly. Assembly runs only
    /// when the matrix is not already assembled; an assembly that had to
    /// grow the preallocated pattern is reported as a performance warning.
    pub fn assemble_distributed_data(&mut self, b: &[f64]) -> Result<(), LsError> {
        self.ensure_live()?;
        if !self.lo.is_distributed() {
            return Err(LsError::Unsupported(
                "operator variant has no distributed data to assemble",
            ));
        }
        self.stage_distributed(b)
    }

    fn stage_distributed(&mut self, b: &[f64]) -> Result<(), LsError> {
        if let Some((rhs, _)) = self.lo.staging_buffers() {
            assert_eq!(b.len(), rhs.len(), "local rhs length does not match the operator");
            rhs.copy_from_slice(b);
        }

        if let Some(mat) = self.lo.matrix().cloned() {
            let pending = !mat.borrow().is_assembled();
            if pending {
                let merged = mat.borrow_mut().assemble();
                self.lo.note_assembly_completed();
                self.lo.mark_setup();
                if merged > 0 {
                    log::warn!(
                        "rank {}: operator assembly reallocated for {} entries outside the preallocated pattern",
                        self.rank,
                        merged
                    );
                }
            }
        }

        if self.shared_mat {
            // the shared matrix was handled through the operator
            if self.pc.matrix().is_some() {
                self.pc.mark_setup();
            }
        } else if let Some(mat) = self.pc.matrix().cloned() {
            let pending = !mat.borrow().is_assembled();
            if pending {
                let merged = mat.borrow_mut().assemble();
                self.pc.mark_setup();
                if merged > 0 {
                    log::warn!(
                        "rank {}: preconditioner assembly reallocated for {} entries outside the preallocated pattern",
                        self.rank,
                        merged
                    );
                }
            }
        }
        Ok(())
    }

    /// Update iterative tolerances. Any argument `<= 0` leaves the
    /// corresponding field unchanged.
    pub fn set_tolerances(
        &mut self,
        reltol: f64,
        abstol: f64,
        dtol: f64,
        itermax: i64,
    ) -> Result<(), LsError> {
        self.ensure_live()?;
        self.opts.tolerances.update(reltol, abstol, dtol, itermax);
        Ok(())
    }

    /// Mark both objects stale for a new nonlinear iterate; the next
    /// `calc_*` call recomputes them.
    pub fn invalidate(&mut self) -> Result<(), LsError> {
        self.ensure_live()?;
        self.pc.invalidate();
        self.lo.invalidate();
        Ok(())
    }

    /// Release preconditioner and operator resources. Idempotent: repeated
    /// calls are no-ops, and a shared matrix is released exactly once.
    pub fn free(&mut self) {
        if self.is_finalized {
            return;
        }
        self.pc.free();
        self.lo.free();
        self.staging = None;
        self.is_finalized = true;
    }
}
