use linsys::{
    FaerFactory, LinearOperator, LinearSolver, LsError, MatrixFactory, MatrixHandle,
    Preconditioner, SolverOptions, SparsityPattern, SystemContext,
};
use std::cell::RefCell;
use std::rc::Rc;

/// One-dimensional diffusion Jacobian: tridiagonal (-1, 2, -1).
struct DiffusionCtx {
    n: usize,
}

impl SystemContext for DiffusionCtx {
    fn dim(&self) -> usize {
        self.n
    }

    fn assemble_jacobian(&mut self, dest: &mut MatrixHandle) -> Result<(), LsError> {
        for i in 0..self.n {
            dest.add(i, i, 2.0);
            if i > 0 {
                dest.add(i, i - 1, -1.0);
            }
            if i + 1 < self.n {
                dest.add(i, i + 1, -1.0);
            }
        }
        Ok(())
    }
}

fn main() {
    let n = 10;
    let factory = FaerFactory;
    let mat = Rc::new(RefCell::new(
        factory
            .create_explicit_matrix(n, &SparsityPattern::Dense, 1, false)
            .unwrap(),
    ));

    let mut ls = LinearSolver::new(
        Preconditioner::none(),
        LinearOperator::dense(mat),
        SolverOptions::new(),
    )
    .unwrap();

    let mut ctx = DiffusionCtx { n };
    ls.calc_linear_operator(&mut ctx, false).unwrap();

    let b = vec![1.0; n];
    let mut x = vec![0.0; n];
    let stats = ls.solve(&b, &mut x).unwrap();
    println!("x = {:?}, stats = {:?}", x, stats);

    // second right-hand side reuses the cached factorization
    let b2: Vec<f64> = (0..n).map(|i| (i as f64).cos()).collect();
    let stats2 = ls.solve(&b2, &mut x).unwrap();
    println!("x = {:?}, stats = {:?}", x, stats2);
    println!(
        "solves = {}, factorizations = {}",
        ls.lo().solve_count(),
        ls.lo().factorization_count()
    );

    ls.free();
}
