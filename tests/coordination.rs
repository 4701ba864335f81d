//! Tests for the recomputation and lifecycle contract of `LinearSolver`:
//! idempotent calc calls, shared-matrix bookkeeping, the tolerance sentinel,
//! staging modes, and idempotent teardown.

use linsys::{
    FaerFactory, LinearOperator, LinearSolver, LsError, MatrixFactory, MatrixHandle,
    ParallelStaging, Preconditioner, ShellPreconditioner, SolverOptions, SparsityPattern,
    SystemContext,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Context assembling a fixed list of matrix entries.
struct EntriesCtx {
    n: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl EntriesCtx {
    fn diagonal(n: usize, d: f64) -> Self {
        EntriesCtx {
            n,
            entries: (0..n).map(|i| (i, i, d)).collect(),
        }
    }
}

impl SystemContext for EntriesCtx {
    fn dim(&self) -> usize {
        self.n
    }

    fn assemble_jacobian(&mut self, dest: &mut MatrixHandle) -> Result<(), LsError> {
        for &(i, j, v) in &self.entries {
            dest.add(i, j, v);
        }
        Ok(())
    }
}

fn dense_handle(n: usize) -> Rc<RefCell<MatrixHandle>> {
    Rc::new(RefCell::new(
        FaerFactory
            .create_explicit_matrix(n, &SparsityPattern::Dense, 1, false)
            .unwrap(),
    ))
}

#[test]
fn calc_pc_is_idempotent() {
    let mut ls = LinearSolver::new(
        Preconditioner::explicit(dense_handle(3), false),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap();
    let mut ctx = EntriesCtx::diagonal(3, 2.0);

    ls.calc_pc(&mut ctx, false).unwrap();
    assert!(ls.pc().is_setup());
    assert_eq!(ls.pc().assembly_count(), 1);

    // no state change: the second call must be a no-op
    ls.calc_pc(&mut ctx, false).unwrap();
    assert_eq!(ls.pc().assembly_count(), 1);

    // a new nonlinear iterate drives exactly one recomputation
    ls.invalidate().unwrap();
    ls.calc_pc(&mut ctx, false).unwrap();
    assert_eq!(ls.pc().assembly_count(), 2);
}

#[test]
fn calc_lo_is_idempotent() {
    let mut ls = LinearSolver::new(
        Preconditioner::none(),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap();
    let mut ctx = EntriesCtx::diagonal(3, 2.0);

    ls.calc_linear_operator(&mut ctx, false).unwrap();
    ls.calc_linear_operator(&mut ctx, false).unwrap();
    assert_eq!(ls.lo().assembly_count(), 1);
}

#[test]
fn none_pc_delegates_to_operator() {
    let mut ls = LinearSolver::new(
        Preconditioner::none(),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap();
    let mut ctx = EntriesCtx::diagonal(3, 2.0);

    ls.calc_pc(&mut ctx, false).unwrap();
    assert!(ls.lo().is_setup());
    assert_eq!(ls.lo().assembly_count(), 1);

    // "preconditioning" degenerates to an exact solve
    let b = vec![2.0, 4.0, 6.0];
    let mut z = vec![0.0; 3];
    ls.apply_pc(&b, &mut z).unwrap();
    assert_eq!(z, vec![1.0, 2.0, 3.0]);
    assert_eq!(ls.lo().solve_count(), 1);
}

#[test]
fn shared_matrix_refreshes_pc_without_compute() {
    let shared = dense_handle(3);
    let mut opts = SolverOptions::new();
    opts.shared_mat = true;
    let mut ls = LinearSolver::new(
        Preconditioner::explicit(Rc::clone(&shared), false),
        LinearOperator::dense(shared),
        opts,
    )
    .unwrap();
    let mut ctx = EntriesCtx::diagonal(3, 4.0);

    ls.calc_pc_and_lo(&mut ctx, false).unwrap();
    assert!(ls.pc().is_setup());
    assert!(ls.lo().is_setup());
    assert_eq!(ls.lo().assembly_count(), 1);
    // the PC's compute was skipped, so its counter must not move
    assert_eq!(ls.pc().assembly_count(), 0);

    // the PC reads the matrix the operator just refreshed
    let r = vec![4.0, 8.0, 12.0];
    let mut z = vec![0.0; 3];
    ls.apply_pc(&r, &mut z).unwrap();
    assert_eq!(z, vec![1.0, 2.0, 3.0]);

    // repeated cycles: the invariant holds for all call sequences
    ls.invalidate().unwrap();
    ls.calc_pc_and_lo(&mut ctx, false).unwrap();
    assert!(ls.pc().is_setup());
    assert_eq!(ls.lo().assembly_count(), 2);
    assert_eq!(ls.pc().assembly_count(), 0);
}

#[test]
fn distinct_matrices_compute_both() {
    let mut ls = LinearSolver::new(
        Preconditioner::explicit(dense_handle(3), false),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap();
    let mut ctx = EntriesCtx::diagonal(3, 4.0);

    ls.calc_pc_and_lo(&mut ctx, false).unwrap();
    assert_eq!(ls.pc().assembly_count(), 1);
    assert_eq!(ls.lo().assembly_count(), 1);
}

#[test]
fn shared_mat_flag_must_match_aliasing() {
    let mut opts = SolverOptions::new();
    opts.shared_mat = true;
    let err = LinearSolver::new(
        Preconditioner::explicit(dense_handle(3), false),
        LinearOperator::dense(dense_handle(3)),
        opts,
    )
    .err()
    .unwrap();
    assert!(matches!(err, LsError::InvariantViolation(_)));

    let shared = dense_handle(3);
    let err = LinearSolver::new(
        Preconditioner::explicit(Rc::clone(&shared), false),
        LinearOperator::dense(shared),
        SolverOptions::new(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, LsError::InvariantViolation(_)));
}

#[test]
fn tolerance_sentinel_updates_only_positive_fields() {
    let mut ls = LinearSolver::new(
        Preconditioner::none(),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap();
    let before = ls.options().tolerances;

    ls.set_tolerances(-1.0, 0.5, -1.0, -1).unwrap();
    let after = ls.options().tolerances;
    assert_eq!(after.abstol, 0.5);
    assert_eq!(after.reltol, before.reltol);
    assert_eq!(after.dtol, before.dtol);
    assert_eq!(after.itermax, before.itermax);
}

/// Shell preconditioner whose drop is observable.
struct TrackedPc {
    drops: Rc<Cell<u32>>,
}

impl ShellPreconditioner for TrackedPc {
    fn apply(&self, r: &[f64], z: &mut [f64]) -> Result<(), LsError> {
        z.copy_from_slice(r);
        Ok(())
    }
}

impl Drop for TrackedPc {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[test]
fn free_is_idempotent_and_releases_once() {
    let drops = Rc::new(Cell::new(0));
    let handle = dense_handle(3);
    let mut ls = LinearSolver::new(
        Preconditioner::shell(Box::new(TrackedPc { drops: Rc::clone(&drops) }), false),
        LinearOperator::dense(Rc::clone(&handle)),
        SolverOptions::new(),
    )
    .unwrap();

    ls.free();
    assert!(ls.is_finalized());
    assert_eq!(drops.get(), 1);
    assert!(handle.borrow().is_freed());

    // repeated free is a no-op, not a double release
    ls.free();
    assert_eq!(drops.get(), 1);

    // every other operation is forbidden after free
    let mut ctx = EntriesCtx::diagonal(3, 2.0);
    assert!(matches!(ls.calc_pc(&mut ctx, false), Err(LsError::Finalized)));
    assert!(matches!(
        ls.solve(&[1.0; 3], &mut [0.0; 3]),
        Err(LsError::Finalized)
    ));
    assert!(matches!(
        ls.set_tolerances(1e-6, -1.0, -1.0, -1),
        Err(LsError::Finalized)
    ));
}

/// Staging double recording each exchange and its blocking mode.
struct TrackedStaging {
    calls: Rc<RefCell<Vec<bool>>>,
}

impl ParallelStaging for TrackedStaging {
    fn stage(&mut self, wait: bool) -> Result<(), LsError> {
        self.calls.borrow_mut().push(wait);
        Ok(())
    }
}

fn sparse_handle(n: usize) -> Rc<RefCell<MatrixHandle>> {
    let rows: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    Rc::new(RefCell::new(
        FaerFactory
            .create_explicit_matrix(n, &SparsityPattern::Rows(rows), 1, false)
            .unwrap(),
    ))
}

#[test]
fn lazy_staging_runs_only_when_needed() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut ls = LinearSolver::new(
        Preconditioner::explicit(dense_handle(3), true),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap()
    .with_staging(Box::new(TrackedStaging { calls: Rc::clone(&calls) }));
    let mut ctx = EntriesCtx::diagonal(3, 2.0);

    // start_comm = false: no staging regardless of the capability
    ls.calc_pc(&mut ctx, false).unwrap();
    assert!(calls.borrow().is_empty());

    // the operator does not need parallel data: still no staging
    ls.calc_linear_operator(&mut ctx, true).unwrap();
    assert!(calls.borrow().is_empty());

    // the preconditioner does: one synchronous exchange
    ls.invalidate().unwrap();
    ls.calc_pc(&mut ctx, true).unwrap();
    assert_eq!(calls.borrow().as_slice(), &[true]);
}

#[test]
fn combined_calc_stages_once_eagerly() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut ls = LinearSolver::new(
        Preconditioner::explicit(dense_handle(4), true),
        LinearOperator::distributed(sparse_handle(4), true),
        SolverOptions::new(),
    )
    .unwrap()
    .with_staging(Box::new(TrackedStaging { calls: Rc::clone(&calls) }));
    let mut ctx = EntriesCtx::diagonal(4, 2.0);

    // both objects need staged data: exactly one blocking exchange
    ls.calc_pc_and_lo(&mut ctx, true).unwrap();
    assert_eq!(calls.borrow().as_slice(), &[true]);
    assert_eq!(ls.pc().assembly_count(), 1);
    assert_eq!(ls.lo().assembly_count(), 1);
}

#[test]
fn staging_without_collaborator_is_an_error() {
    let mut ls = LinearSolver::new(
        Preconditioner::explicit(dense_handle(3), true),
        LinearOperator::dense(dense_handle(3)),
        SolverOptions::new(),
    )
    .unwrap();
    let mut ctx = EntriesCtx::diagonal(3, 2.0);
    let err = ls.calc_pc(&mut ctx, true).unwrap_err();
    assert!(matches!(err, LsError::InvariantViolation(_)));
}
