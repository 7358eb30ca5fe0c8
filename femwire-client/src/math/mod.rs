//! Proxies for math objects living in the engine workspace.
//!
//! A proxy holds a name, an element type and a weak reference to its
//! session. The engine owns the data; every operation is one or a few engine
//! commands. Operations that produce a new object allocate a fresh workspace
//! name; the `*_assign` variants mutate in place.

mod handle;
mod matrix;
mod solver;
mod vector;

pub use matrix::{CsrMatrix, DenseMatrix, Matrix, MatrixKind};
pub use solver::{FactorizeOptions, Solver, SolverAlgo};
pub use vector::Vector;

pub(crate) use handle::{type_char, Handle};

use crate::error::ClientError;
use crate::session::{Session, WeakSession};
use femwire_protocol::message::ObjectKind;
use femwire_protocol::{Array, ValueType};

/// Engine parameter that receives scalar results.
pub(crate) const SCALAR_PARAM: &str = "FW_VAL";

/// Norm used by [`MathObject::norm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormKind {
    /// Euclidean norm.
    #[default]
    Nrm2,
    /// Absolute sum.
    Nrm1,
    /// Largest absolute value.
    NrmInf,
}

impl NormKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NormKind::Nrm2 => "NRM2",
            NormKind::Nrm1 => "NRM1",
            NormKind::NrmInf => "NRMINF",
        }
    }
}

/// Fill applied right after allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Random,
    Constant(f64),
}

impl Init {
    fn command_args(self) -> String {
        match self {
            Init::Zeros => "ZERO".to_string(),
            Init::Ones => "CONST,1".to_string(),
            Init::Random => "RAND".to_string(),
            Init::Constant(v) => format!("CONST,{}", v),
        }
    }
}

/// Matrices stored in a FULL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullMatrix {
    Stiff,
    Mass,
    Damp,
    Gmat,
    KRe,
    KIm,
}

impl FullMatrix {
    pub fn as_str(self) -> &'static str {
        match self {
            FullMatrix::Stiff => "STIFF",
            FullMatrix::Mass => "MASS",
            FullMatrix::Damp => "DAMP",
            FullMatrix::Gmat => "GMAT",
            FullMatrix::KRe => "K_RE",
            FullMatrix::KIm => "K_IM",
        }
    }

    fn allows_complex(self) -> bool {
        !matches!(self, FullMatrix::Stiff | FullMatrix::Mass | FullMatrix::Damp)
    }
}

/// Vectors stored in a FULL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullVector {
    Rhs,
    Gvec,
    Back,
    Forward,
}

impl FullVector {
    pub fn as_str(self) -> &'static str {
        match self {
            FullVector::Rhs => "RHS",
            FullVector::Gvec => "GVEC",
            FullVector::Back => "BACK",
            FullVector::Forward => "FORWARD",
        }
    }

    /// Element type used when the caller does not pick one.
    pub fn default_type(self) -> ValueType {
        match self {
            FullVector::Back | FullVector::Forward => ValueType::Int32,
            FullVector::Rhs | FullVector::Gvec => ValueType::Float64,
        }
    }
}

/// Settings for [`MathApi::eigs`].
#[derive(Debug, Clone, Default)]
pub struct EigOptions {
    /// Number of eigenvalues to extract.
    pub nev: u32,
    /// Extraction method; chosen from the matrices when unset.
    pub algo: Option<String>,
    pub fmin: Option<f64>,
    pub fmax: Option<f64>,
}

/// Behaviour shared by vectors and matrices.
pub trait MathObject: Sized {
    #[doc(hidden)]
    fn handle(&self) -> &Handle;

    /// Workspace name.
    fn name(&self) -> &str {
        &self.handle().name
    }

    fn value_type(&self) -> ValueType {
        self.handle().value_type
    }

    /// Remote copy under a fresh name.
    fn copy(&self) -> Result<Self, ClientError>;

    /// `self = a * x + b * self`. Operands must match in shape and type.
    fn axpy(&self, x: &Self, a: f64, b: f64) -> Result<(), ClientError> {
        self.handle().check_same_shape(x.handle())?;
        self.handle().run(&format!(
            "*AXPY,{},0,{},{},0,{}",
            a,
            x.name(),
            b,
            self.name()
        ))?;
        Ok(())
    }

    /// `self + other` as a new object.
    fn add(&self, other: &Self) -> Result<Self, ClientError> {
        self.handle().check_same_shape(other.handle())?;
        let out = self.copy()?;
        out.axpy(other, 1.0, 1.0)?;
        Ok(out)
    }

    /// `self - other` as a new object.
    fn subtract(&self, other: &Self) -> Result<Self, ClientError> {
        self.handle().check_same_shape(other.handle())?;
        let out = self.copy()?;
        out.axpy(other, -1.0, 1.0)?;
        Ok(out)
    }

    fn add_assign(&self, other: &Self) -> Result<(), ClientError> {
        self.axpy(other, 1.0, 1.0)
    }

    fn sub_assign(&self, other: &Self) -> Result<(), ClientError> {
        self.axpy(other, -1.0, 1.0)
    }

    /// Multiplies every element in place.
    fn scale(&self, factor: f64) -> Result<(), ClientError> {
        self.handle()
            .run(&format!("*SCAL,{},{}", self.name(), factor))?;
        Ok(())
    }

    /// Divides every element in place.
    fn div_assign(&self, divisor: f64) -> Result<(), ClientError> {
        if divisor == 0.0 {
            return Err(ClientError::ZeroDivisor);
        }
        self.scale(1.0 / divisor)
    }

    fn norm(&self, kind: NormKind) -> Result<f64, ClientError> {
        self.handle().scalar(&format!(
            "*NRM,{},{},{}",
            self.name(),
            kind.as_str(),
            SCALAR_PARAM
        ))
    }

    /// Overwrites every element according to `init`.
    fn fill(&self, init: Init) -> Result<(), ClientError> {
        self.handle()
            .run(&format!("*INIT,{},{}", self.name(), init.command_args()))?;
        Ok(())
    }

    fn zeros(&self) -> Result<(), ClientError> {
        self.fill(Init::Zeros)
    }

    fn ones(&self) -> Result<(), ClientError> {
        self.fill(Init::Ones)
    }

    fn rand(&self) -> Result<(), ClientError> {
        self.fill(Init::Random)
    }

    /// Engine-side text rendering.
    fn print(&self) -> Result<String, ClientError> {
        self.handle().run(&format!("*PRINT,{}", self.name()))
    }

    /// Releases the remote object. The proxy must not be used afterwards.
    fn free(self) -> Result<(), ClientError> {
        self.handle().run(&format!("*FREE,{}", self.name()))?;
        Ok(())
    }
}

/// Entry point for creating and combining workspace objects.
#[derive(Debug, Clone)]
pub struct MathApi {
    session: WeakSession,
}

impl MathApi {
    pub(crate) fn new(session: WeakSession) -> Self {
        Self { session }
    }

    fn session(&self) -> Result<Session, ClientError> {
        self.session.upgrade()
    }

    fn handle(&self, name: String, value_type: ValueType) -> Handle {
        Handle::new(name, value_type, self.session.clone())
    }

    fn name_or_fresh(&self, session: &Session, name: Option<&str>) -> Result<String, ClientError> {
        match name {
            Some(name) => {
                crate::names::validate_name(name)?;
                Ok(name.to_string())
            }
            None => session.names().allocate(),
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a vector of `size` elements.
    pub fn vec(
        &self,
        size: u64,
        value_type: ValueType,
        init: Option<Init>,
    ) -> Result<Vector, ClientError> {
        let t = type_char(value_type)?;
        let session = self.session()?;
        let name = session.names().allocate()?;
        session.run(&format!("*VEC,{},{},ALLOC,{}", name, t, size))?;
        let vector = Vector::from_handle(self.handle(name, value_type));
        if let Some(init) = init {
            vector.fill(init)?;
        }
        Ok(vector)
    }

    /// Allocates a dense `rows`×`cols` matrix.
    pub fn mat(
        &self,
        rows: u64,
        cols: u64,
        value_type: ValueType,
        init: Option<Init>,
    ) -> Result<Matrix, ClientError> {
        let t = type_char(value_type)?;
        let session = self.session()?;
        let name = session.names().allocate()?;
        session.run(&format!("*DMAT,{},{},ALLOC,{},{}", name, t, rows, cols))?;
        let matrix = Matrix::from_handle(self.handle(name, value_type), MatrixKind::Dense);
        if let Some(init) = init {
            matrix.fill(init)?;
        }
        Ok(matrix)
    }

    /// Float64 vector of zeros.
    pub fn zeros(&self, size: u64) -> Result<Vector, ClientError> {
        self.vec(size, ValueType::Float64, Some(Init::Zeros))
    }

    /// Float64 vector of ones.
    pub fn ones(&self, size: u64) -> Result<Vector, ClientError> {
        self.vec(size, ValueType::Float64, Some(Init::Ones))
    }

    /// Float64 vector of random values.
    pub fn rand(&self, size: u64) -> Result<Vector, ClientError> {
        self.vec(size, ValueType::Float64, Some(Init::Random))
    }

    pub fn zeros_mat(&self, rows: u64, cols: u64) -> Result<Matrix, ClientError> {
        self.mat(rows, cols, ValueType::Float64, Some(Init::Zeros))
    }

    pub fn ones_mat(&self, rows: u64, cols: u64) -> Result<Matrix, ClientError> {
        self.mat(rows, cols, ValueType::Float64, Some(Init::Ones))
    }

    pub fn rand_mat(&self, rows: u64, cols: u64) -> Result<Matrix, ClientError> {
        self.mat(rows, cols, ValueType::Float64, Some(Init::Random))
    }

    // ------------------------------------------------------------------
    // Upload and wrapping
    // ------------------------------------------------------------------

    /// Uploads a local array as a workspace vector.
    pub fn set_vec(&self, data: &Array, name: Option<&str>) -> Result<Vector, ClientError> {
        let session = self.session()?;
        let name = self.name_or_fresh(&session, name)?;
        session.set_vec(&name, data)?;
        Ok(Vector::from_handle(self.handle(name, data.value_type())))
    }

    /// Uploads a dense local matrix.
    pub fn dense_matrix(
        &self,
        data: &DenseMatrix,
        name: Option<&str>,
    ) -> Result<Matrix, ClientError> {
        let session = self.session()?;
        let name = self.name_or_fresh(&session, name)?;
        session.set_mat(&name, data.data(), data.rows() as u64, data.cols() as u64)?;
        Ok(Matrix::from_handle(
            self.handle(name, data.data().value_type()),
            MatrixKind::Dense,
        ))
    }

    /// Uploads a square CSR matrix.
    ///
    /// The three CSR arrays travel as temporary vectors with 1-based
    /// indices and are released once the engine has assembled the matrix.
    pub fn sparse_matrix(
        &self,
        data: &CsrMatrix,
        symmetric: bool,
        name: Option<&str>,
    ) -> Result<Matrix, ClientError> {
        if data.rows() != data.cols() {
            return Err(ClientError::NotSquare {
                rows: data.rows() as u64,
                cols: data.cols() as u64,
            });
        }
        let value_type = data.values().value_type();
        let t = type_char(value_type)?;
        let session = self.session()?;
        let name = self.name_or_fresh(&session, name)?;

        let ptr = format!("{}_PTR", name);
        let ind = format!("{}_IND", name);
        let vals = format!("{}_DATA", name);
        let one_based = |v: &[i64]| Array::from(v.iter().map(|&i| i + 1).collect::<Vec<i64>>());

        session.set_vec(&vals, data.values())?;
        session.set_vec(&ptr, &one_based(data.indptr()))?;
        session.set_vec(&ind, &one_based(data.indices()))?;
        session.run(&format!(
            "*SMAT,{},{},ALLOC,CSR,{},{},{},{}",
            name,
            t,
            ptr,
            ind,
            vals,
            if symmetric { "TRUE" } else { "FALSE" }
        ))?;
        for temp in [&ptr, &ind, &vals] {
            session.run(&format!("*FREE,{}", temp))?;
        }
        Ok(Matrix::from_handle(
            self.handle(name, value_type),
            MatrixKind::Sparse,
        ))
    }

    /// Wraps an existing workspace vector.
    pub fn open_vec(&self, name: &str) -> Result<Vector, ClientError> {
        let info = self.session()?.data_info(name)?;
        if info.objtype != ObjectKind::Vec {
            return Err(ClientError::UnexpectedReply(format!(
                "{} is a {:?}, not a vector",
                name, info.objtype
            )));
        }
        Ok(Vector::from_handle(self.handle(info.name, info.stype)))
    }

    /// Wraps an existing dense or sparse workspace matrix.
    pub fn open_mat(&self, name: &str) -> Result<Matrix, ClientError> {
        let info = self.session()?.data_info(name)?;
        let kind = match info.objtype {
            ObjectKind::Dmat => MatrixKind::Dense,
            ObjectKind::Smat => MatrixKind::Sparse,
            other => {
                return Err(ClientError::UnexpectedReply(format!(
                    "{} is a {:?}, not a matrix",
                    name, other
                )))
            }
        };
        Ok(Matrix::from_handle(self.handle(info.name, info.stype), kind))
    }

    // ------------------------------------------------------------------
    // FULL file imports
    // ------------------------------------------------------------------

    fn check_file(&self, session: &Session, fname: &str) -> Result<(), ClientError> {
        if session.list_files()?.iter().any(|f| f == fname) {
            Ok(())
        } else {
            Err(ClientError::FileNotFound(fname.to_string()))
        }
    }

    /// Imports a sparse matrix from a FULL file.
    pub fn load_matrix_from_file(
        &self,
        value_type: ValueType,
        fname: &str,
        which: FullMatrix,
    ) -> Result<Matrix, ClientError> {
        let t = match value_type {
            ValueType::Float64 => 'D',
            ValueType::Complex128 if which.allows_complex() => 'Z',
            other => return Err(ClientError::UnsupportedType(other)),
        };
        let session = self.session()?;
        self.check_file(&session, fname)?;
        let name = session.names().allocate()?;
        session.run(&format!(
            "*SMAT,{},{},IMPORT,FULL,{},{}",
            name,
            t,
            fname,
            which.as_str()
        ))?;
        Ok(Matrix::from_handle(
            self.handle(name, value_type),
            MatrixKind::Sparse,
        ))
    }

    pub fn stiff(&self, fname: &str) -> Result<Matrix, ClientError> {
        self.load_matrix_from_file(ValueType::Float64, fname, FullMatrix::Stiff)
    }

    pub fn mass(&self, fname: &str) -> Result<Matrix, ClientError> {
        self.load_matrix_from_file(ValueType::Float64, fname, FullMatrix::Mass)
    }

    pub fn damp(&self, fname: &str) -> Result<Matrix, ClientError> {
        self.load_matrix_from_file(ValueType::Float64, fname, FullMatrix::Damp)
    }

    /// Imports a vector from a FULL file.
    pub fn get_vec(
        &self,
        value_type: Option<ValueType>,
        fname: &str,
        which: FullVector,
    ) -> Result<Vector, ClientError> {
        let value_type = value_type.unwrap_or(which.default_type());
        let t = type_char(value_type)?;
        let session = self.session()?;
        self.check_file(&session, fname)?;
        let name = session.names().allocate()?;
        session.run(&format!(
            "*VEC,{},{},IMPORT,FULL,{},{}",
            name,
            t,
            fname,
            which.as_str()
        ))?;
        Ok(Vector::from_handle(self.handle(name, value_type)))
    }

    pub fn rhs(&self, fname: &str) -> Result<Vector, ClientError> {
        self.get_vec(None, fname, FullVector::Rhs)
    }

    // ------------------------------------------------------------------
    // Decompositions
    // ------------------------------------------------------------------

    /// Singular value decomposition of `mat`; results land in `sigma` and `v`.
    pub fn svd(
        &self,
        mat: &Matrix,
        thresh: Option<f64>,
        sigma: Option<&Vector>,
        v: Option<&Matrix>,
    ) -> Result<(), ClientError> {
        self.session()?.run(&format!(
            "*COMP,{},SVD,{},{},{}",
            mat.name(),
            opt(thresh),
            sigma.map(|s| s.name()).unwrap_or(""),
            v.map(|m| m.name()).unwrap_or("")
        ))?;
        Ok(())
    }

    /// Modified Gram-Schmidt orthogonalisation of the columns of `mat`.
    pub fn mgs(&self, mat: &Matrix, thresh: Option<f64>) -> Result<(), ClientError> {
        self.session()?
            .run(&format!("*COMP,{},MGS,{}", mat.name(), opt(thresh)))?;
        Ok(())
    }

    /// Converts a dense matrix to sparse storage in place, dropping values
    /// whose magnitude is below `thresh`.
    pub fn sparsify(&self, mat: Matrix, thresh: Option<f64>) -> Result<Matrix, ClientError> {
        self.session()?
            .run(&format!("*COMP,{},SPARSE,{}", mat.name(), opt(thresh)))?;
        Ok(mat.with_kind(MatrixKind::Sparse))
    }

    /// Modal extraction on `k` (and `m`, `c`). Returns the eigenvalues;
    /// eigenvectors are written to `phi` when given.
    pub fn eigs(
        &self,
        k: &Matrix,
        m: &Matrix,
        c: Option<&Matrix>,
        phi: Option<&Matrix>,
        options: &EigOptions,
    ) -> Result<Vector, ClientError> {
        let algo = match c {
            Some(_) => "DAMP".to_string(),
            None if k.is_symmetric()? && m.is_symmetric()? => {
                options.algo.clone().unwrap_or_else(|| "LANB".to_string())
            }
            None => "UNSYM".to_string(),
        };
        let session = self.session()?;
        session.run("/SOLU")?;
        session.run("ANTYPE,MODAL")?;
        session.run(&format!(
            "MODOPT,{},{},{},{}",
            algo,
            options.nev,
            opt(options.fmin),
            opt(options.fmax)
        ))?;
        let ev = self.vec(0, ValueType::Float64, None)?;
        session.run(&format!(
            "*EIG,{},{},{},{},{}",
            k.name(),
            m.name(),
            c.map(|c| c.name()).unwrap_or(""),
            ev.name(),
            phi.map(|p| p.name()).unwrap_or("")
        ))?;
        Ok(ev)
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    pub fn dot(&self, a: &Vector, b: &Vector) -> Result<f64, ClientError> {
        a.dot(b)
    }

    pub fn add<T: MathObject>(&self, a: &T, b: &T) -> Result<T, ClientError> {
        a.add(b)
    }

    pub fn subtract<T: MathObject>(&self, a: &T, b: &T) -> Result<T, ClientError> {
        a.subtract(b)
    }

    pub fn norm<T: MathObject>(&self, obj: &T, kind: NormKind) -> Result<f64, ClientError> {
        obj.norm(kind)
    }

    /// Factorizes `mat` with the default engine for its storage kind.
    pub fn factorize(&self, mat: &Matrix) -> Result<Solver, ClientError> {
        self.factorize_with(mat, &FactorizeOptions::default())
    }

    pub fn factorize_with(
        &self,
        mat: &Matrix,
        options: &FactorizeOptions,
    ) -> Result<Solver, ClientError> {
        let name = self.session()?.names().allocate()?;
        let mut solver = Solver::from_handle(self.handle(name, mat.value_type()));
        solver.factorize(mat, options)?;
        Ok(solver)
    }

    /// Factorizes `mat` and solves `mat * x = b`.
    pub fn solve(&self, mat: &Matrix, b: &Vector) -> Result<Vector, ClientError> {
        self.factorize(mat)?.solve(b, None)
    }

    // ------------------------------------------------------------------
    // Workspace
    // ------------------------------------------------------------------

    /// Releases one object.
    pub fn free<T: MathObject>(&self, obj: T) -> Result<(), ClientError> {
        obj.free()
    }

    /// Releases every workspace object.
    pub fn free_all(&self) -> Result<(), ClientError> {
        self.session()?.run("*FREE,ALL")?;
        Ok(())
    }

    /// Engine listing of the workspace.
    pub fn status(&self) -> Result<String, ClientError> {
        self.session()?.run("*STATUS")
    }
}

fn opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    #[test]
    fn test_vec_allocation_commands() {
        let recorder = Recorder::new();
        let math = recorder.session().math();

        let v = math.vec(10, ValueType::Float64, Some(Init::Constant(2.5))).unwrap();
        assert_eq!(v.value_type(), ValueType::Float64);
        assert_eq!(
            recorder.commands(),
            vec![
                format!("*VEC,{},D,ALLOC,10", v.name()),
                format!("*INIT,{},CONST,2.5", v.name()),
            ]
        );
    }

    #[test]
    fn test_int16_cannot_be_allocated() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        assert!(matches!(
            math.vec(3, ValueType::Int16, None),
            Err(ClientError::UnsupportedType(ValueType::Int16))
        ));
        assert!(recorder.commands().is_empty());
    }

    #[test]
    fn test_mat_allocation_and_names_unique() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let a = math.rand_mat(3, 4).unwrap();
        let b = math.zeros_mat(3, 4).unwrap();
        assert_ne!(a.name(), b.name());
        assert_eq!(a.kind(), MatrixKind::Dense);
        assert_eq!(
            recorder.commands()[0],
            format!("*DMAT,{},D,ALLOC,3,4", a.name())
        );
        assert_eq!(recorder.commands()[1], format!("*INIT,{},RAND", a.name()));
    }

    #[test]
    fn test_add_copies_then_axpy() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let a = math.ones(4).unwrap();
        let b = math.ones(4).unwrap();
        recorder.clear();

        let c = math.add(&a, &b).unwrap();
        assert_eq!(
            recorder.commands(),
            vec![
                format!("*VEC,{},D,COPY,{}", c.name(), a.name()),
                format!("*AXPY,1,0,{},1,0,{}", b.name(), c.name()),
            ]
        );

        recorder.clear();
        a.sub_assign(&b).unwrap();
        assert_eq!(
            recorder.commands(),
            vec![format!("*AXPY,-1,0,{},1,0,{}", b.name(), a.name())]
        );
    }

    #[test]
    fn test_mismatched_operands_rejected_before_any_command() {
        let recorder = Recorder::new().with_shape(3, 1);
        let math = recorder.session().math();
        let a = math.ones(3).unwrap();
        let b = math.ones(5).unwrap();
        recorder.set_object_shape(b.name(), 5, 1);
        let c = math.vec(3, ValueType::Int32, None).unwrap();
        recorder.clear();

        for err in [
            a.add(&b).unwrap_err(),
            a.subtract(&b).unwrap_err(),
            a.add_assign(&b).unwrap_err(),
            a.sub_assign(&b).unwrap_err(),
            a.axpy(&b, 2.0, 1.0).unwrap_err(),
            a.dot(&b).unwrap_err(),
        ] {
            assert!(matches!(err, ClientError::ShapeMismatch(_)), "{:?}", err);
            assert!(err.is_validation());
        }
        assert!(matches!(
            a.add(&c),
            Err(ClientError::TypeMismatch {
                left: ValueType::Float64,
                right: ValueType::Int32
            })
        ));
        // no copy was made and nothing was sent
        assert!(recorder.commands().is_empty());
    }

    #[test]
    fn test_div_by_zero_is_local() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let v = math.ones(4).unwrap();
        recorder.clear();

        assert!(matches!(v.div_assign(0.0), Err(ClientError::ZeroDivisor)));
        assert!(recorder.commands().is_empty());

        v.div_assign(4.0).unwrap();
        assert_eq!(recorder.commands(), vec![format!("*SCAL,{},0.25", v.name())]);
    }

    #[test]
    fn test_norm_reads_scalar() {
        let recorder = Recorder::new().with_scalar(5.0);
        let math = recorder.session().math();
        let v = math.ones(25).unwrap();
        assert_eq!(math.norm(&v, NormKind::Nrm2).unwrap(), 5.0);
        assert_eq!(
            recorder.commands().last().unwrap(),
            &format!("*NRM,{},NRM2,FW_VAL", v.name())
        );
    }

    #[test]
    fn test_sparse_upload_sequence() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let csr = CsrMatrix::new(
            2,
            2,
            vec![0, 1, 2],
            vec![0, 1],
            Array::from(vec![4.0f64, 5.0]),
        )
        .unwrap();

        let k = math.sparse_matrix(&csr, true, Some("KMAT")).unwrap();
        assert_eq!(k.kind(), MatrixKind::Sparse);

        let uploads = recorder.uploads();
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0].0, "KMAT_DATA");
        assert_eq!(uploads[1].0, "KMAT_PTR");
        assert_eq!(uploads[1].1, Array::from(vec![1i64, 2, 3]));
        assert_eq!(uploads[2].0, "KMAT_IND");
        assert_eq!(uploads[2].1, Array::from(vec![1i64, 2]));
        assert_eq!(
            recorder.commands(),
            vec![
                "*SMAT,KMAT,D,ALLOC,CSR,KMAT_PTR,KMAT_IND,KMAT_DATA,TRUE".to_string(),
                "*FREE,KMAT_PTR".to_string(),
                "*FREE,KMAT_IND".to_string(),
                "*FREE,KMAT_DATA".to_string(),
            ]
        );
    }

    #[test]
    fn test_sparse_upload_requires_square() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        let csr = CsrMatrix::new(1, 2, vec![0, 1], vec![1], Array::from(vec![1.0f64])).unwrap();
        assert!(matches!(
            math.sparse_matrix(&csr, false, None),
            Err(ClientError::NotSquare { rows: 1, cols: 2 })
        ));
        assert!(recorder.uploads().is_empty());
    }

    #[test]
    fn test_load_matrix_rejects_complex_stiffness() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        assert!(matches!(
            math.load_matrix_from_file(ValueType::Complex128, "file.full", FullMatrix::Stiff),
            Err(ClientError::UnsupportedType(ValueType::Complex128))
        ));
    }

    #[test]
    fn test_load_matrix_requires_file() {
        let recorder = Recorder::new();
        let math = recorder.session().math();
        assert!(matches!(
            math.stiff("missing.full"),
            Err(ClientError::FileNotFound(f)) if f == "missing.full"
        ));

        recorder.add_file("model.full");
        let k = math.stiff("model.full").unwrap();
        assert_eq!(
            recorder.commands(),
            vec![format!("*SMAT,{},D,IMPORT,FULL,model.full,STIFF", k.name())]
        );

        let back = math
            .get_vec(None, "model.full", FullVector::Back)
            .unwrap();
        assert_eq!(back.value_type(), ValueType::Int32);
    }

    #[test]
    fn test_eigs_picks_algorithm() {
        let recorder = Recorder::new().with_mattype(Some(0));
        let math = recorder.session().math();
        let k = math.rand_mat(3, 3).unwrap();
        let m = math.rand_mat(3, 3).unwrap();
        recorder.clear();

        let options = EigOptions {
            nev: 4,
            ..Default::default()
        };
        let ev = math.eigs(&k, &m, None, None, &options).unwrap();
        let commands = recorder.commands();
        assert!(commands.contains(&"MODOPT,LANB,4,,".to_string()));
        assert_eq!(
            commands.last().unwrap(),
            &format!("*EIG,{},{},,{},", k.name(), m.name(), ev.name())
        );

        recorder.clear();
        math.eigs(&k, &m, Some(&m), None, &options).unwrap();
        assert!(recorder.commands().contains(&"MODOPT,DAMP,4,,".to_string()));
    }

    #[test]
    fn test_eigs_unsymmetric_when_storage_unknown() {
        let recorder = Recorder::new().with_mattype(None);
        let math = recorder.session().math();
        let k = math.rand_mat(3, 3).unwrap();
        let options = EigOptions {
            nev: 2,
            algo: Some("LANB".to_string()),
            ..Default::default()
        };
        math.eigs(&k, &k, None, None, &options).unwrap();
        assert!(recorder.commands().contains(&"MODOPT,UNSYM,2,,".to_string()));
    }

    #[test]
    fn test_proxy_outliving_session() {
        let session = crate::testing::scripted(|req, _| {
            Ok(crate::testing::ok(req, serde_json::json!({ "output": "" })))
        });
        let v = session.math().ones(3).unwrap();
        drop(session);
        assert!(matches!(
            v.scale(2.0),
            Err(ClientError::SessionTerminated(_))
        ));
    }

    #[test]
    fn test_free_all_and_status() {
        let recorder = Recorder::new();
        let session = recorder.session();
        let math = session.math();
        math.free_all().unwrap();
        math.status().unwrap();
        assert_eq!(recorder.commands(), vec!["*FREE,ALL", "*STATUS"]);
    }
}
