use super::{Handle, Matrix, MathObject, MatrixKind, Vector};
use crate::error::ClientError;

/// Linear solver package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverAlgo {
    /// Dense LU.
    Lapack,
    /// Sparse direct.
    Dsp,
}

impl SolverAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            SolverAlgo::Lapack => "LAPACK",
            SolverAlgo::Dsp => "DSP",
        }
    }

    /// Default package for a storage kind.
    pub fn for_kind(kind: MatrixKind) -> Self {
        match kind {
            MatrixKind::Dense => SolverAlgo::Lapack,
            MatrixKind::Sparse => SolverAlgo::Dsp,
        }
    }
}

/// How to factorize.
#[derive(Debug, Clone, Default)]
pub struct FactorizeOptions {
    /// Overrides the per-kind default.
    pub algo: Option<SolverAlgo>,
    /// Factorize a remote copy and leave the matrix untouched.
    pub on_copy: bool,
}

/// A factorized linear system in the engine workspace.
#[derive(Debug, Clone)]
pub struct Solver {
    handle: Handle,
    factored: Option<Matrix>,
}

impl Solver {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            factored: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    /// The matrix that was factorized, once [`Solver::factorize`] succeeded.
    pub fn factored(&self) -> Option<&Matrix> {
        self.factored.as_ref()
    }

    /// Binds `mat` to this solver and factorizes it. The matrix must be
    /// square.
    pub fn factorize(&mut self, mat: &Matrix, options: &FactorizeOptions) -> Result<(), ClientError> {
        let (rows, cols) = mat.shape()?;
        if rows != cols {
            return Err(ClientError::NotSquare { rows, cols });
        }
        let target = if options.on_copy {
            mat.copy()?
        } else {
            mat.clone()
        };
        let algo = options.algo.unwrap_or(SolverAlgo::for_kind(mat.kind()));

        self.handle.run(&format!(
            "*LSENGINE,{},{},{}",
            algo.as_str(),
            self.handle.name,
            target.name()
        ))?;
        tracing::debug!("Factorizing {} with {}", target.name(), algo.as_str());
        self.handle
            .run(&format!("*LSFACTOR,{}", self.handle.name))?;
        self.factored = Some(target);
        Ok(())
    }

    /// Solves for `b`, writing into `x` when given or a copy of `b`
    /// otherwise.
    pub fn solve(&self, b: &Vector, x: Option<&Vector>) -> Result<Vector, ClientError> {
        let x = match x {
            Some(x) => x.clone(),
            None => b.copy()?,
        };
        self.handle.run(&format!(
            "*LSBAC,{},{},{}",
            self.handle.name,
            b.name(),
            x.name()
        ))?;
        Ok(x)
    }

    /// Releases the solver.
    pub fn free(self) -> Result<(), ClientError> {
        self.handle.run(&format!("*FREE,{}", self.handle.name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    #[test]
    fn test_default_algo_by_kind() {
        assert_eq!(SolverAlgo::for_kind(MatrixKind::Dense), SolverAlgo::Lapack);
        assert_eq!(SolverAlgo::for_kind(MatrixKind::Sparse), SolverAlgo::Dsp);
    }

    #[test]
    fn test_factorize_and_solve_commands() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let k = math.rand_mat(3, 3).unwrap();
        let b = math.ones(3).unwrap();
        recorder.clear();

        let solver = math.factorize(&k).unwrap();
        let x = solver.solve(&b, None).unwrap();
        assert_eq!(
            recorder.commands(),
            vec![
                format!("*LSENGINE,LAPACK,{},{}", solver.name(), k.name()),
                format!("*LSFACTOR,{}", solver.name()),
                format!("*VEC,{},D,COPY,{}", x.name(), b.name()),
                format!("*LSBAC,{},{},{}", solver.name(), b.name(), x.name()),
            ]
        );
        assert_eq!(solver.factored().unwrap().name(), k.name());
    }

    #[test]
    fn test_factorize_on_copy() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let k = math.rand_mat(3, 3).unwrap();
        recorder.clear();

        let options = FactorizeOptions {
            algo: Some(SolverAlgo::Dsp),
            on_copy: true,
        };
        let solver = k.factorize(&options).unwrap();
        let copy = solver.factored().unwrap();
        assert_ne!(copy.name(), k.name());
        assert_eq!(
            recorder.commands()[1],
            format!("*LSENGINE,DSP,{},{}", solver.name(), copy.name())
        );
    }

    #[test]
    fn test_non_square_rejected_before_mutation() {
        let recorder = Recorder::new().with_shape(2, 3);
        let math = recorder.session().math();
        let k = math.rand_mat(2, 3).unwrap();
        recorder.clear();

        assert!(matches!(
            math.factorize(&k),
            Err(ClientError::NotSquare { rows: 2, cols: 3 })
        ));
        assert!(recorder.commands().is_empty());
    }
}
