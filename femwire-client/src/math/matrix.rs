use super::{FactorizeOptions, Handle, MathObject, Solver, Vector};
use crate::error::ClientError;
use femwire_protocol::message::ObjectKind;
use femwire_protocol::{Array, Complex, Element};

/// Storage kind of a workspace matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixKind {
    Dense,
    Sparse,
}

impl MatrixKind {
    fn alloc_command(self) -> &'static str {
        match self {
            MatrixKind::Dense => "*DMAT",
            MatrixKind::Sparse => "*SMAT",
        }
    }
}

/// A local dense matrix in column-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    data: Array,
}

impl DenseMatrix {
    pub fn new(rows: usize, cols: usize, data: Array) -> Result<Self, ClientError> {
        if rows * cols != data.len() {
            return Err(ClientError::ShapeMismatch(format!(
                "{}x{} matrix needs {} values, got {}",
                rows,
                cols,
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a float64 matrix from rows of equal length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, ClientError> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(ClientError::ShapeMismatch("ragged rows".to_string()));
        }
        let mut data = Vec::with_capacity(rows.len() * cols);
        for j in 0..cols {
            data.extend(rows.iter().map(|r| r[j]));
        }
        Self::new(rows.len(), cols, Array::from(data))
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Column-major elements.
    pub fn data(&self) -> &Array {
        &self.data
    }

    pub fn into_data(self) -> Array {
        self.data
    }

    /// Element `(i, j)` widened to `f64`; `None` for complex matrices or
    /// out-of-range indices.
    pub fn get_f64(&self, i: usize, j: usize) -> Option<f64> {
        if i >= self.rows || j >= self.cols {
            return None;
        }
        let k = j * self.rows + i;
        match &self.data {
            Array::Int16(v) => Some(v[k] as f64),
            Array::Int32(v) => Some(v[k] as f64),
            Array::Int64(v) => Some(v[k] as f64),
            Array::Float32(v) => Some(v[k] as f64),
            Array::Float64(v) => Some(v[k]),
            Array::Complex64(_) | Array::Complex128(_) => None,
        }
    }
}

/// A local matrix in compressed sparse row form with 0-based indices.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    rows: usize,
    cols: usize,
    indptr: Vec<i64>,
    indices: Vec<i64>,
    values: Array,
}

impl CsrMatrix {
    pub fn new(
        rows: usize,
        cols: usize,
        indptr: Vec<i64>,
        indices: Vec<i64>,
        values: Array,
    ) -> Result<Self, ClientError> {
        if indptr.len() != rows + 1 {
            return Err(ClientError::ShapeMismatch(format!(
                "indptr has {} entries for {} rows",
                indptr.len(),
                rows
            )));
        }
        if indices.len() != values.len() {
            return Err(ClientError::ShapeMismatch(format!(
                "{} column indices for {} values",
                indices.len(),
                values.len()
            )));
        }
        let nnz = indices.len() as i64;
        if indptr.first() != Some(&0)
            || indptr.last() != Some(&nnz)
            || indptr.windows(2).any(|w| w[0] > w[1])
        {
            return Err(ClientError::ShapeMismatch(
                "indptr must rise from 0 to the value count".to_string(),
            ));
        }
        if indices.iter().any(|&c| c < 0 || c as usize >= cols) {
            return Err(ClientError::ShapeMismatch(format!(
                "column index out of range for {} columns",
                cols
            )));
        }
        Ok(Self {
            rows,
            cols,
            indptr,
            indices,
            values,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn indptr(&self) -> &[i64] {
        &self.indptr
    }

    pub fn indices(&self) -> &[i64] {
        &self.indices
    }

    pub fn values(&self) -> &Array {
        &self.values
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Expands to a dense column-major matrix of the same element type.
    pub fn to_dense(&self) -> DenseMatrix {
        let data = match &self.values {
            Array::Int16(v) => Array::from(self.scatter(v)),
            Array::Int32(v) => Array::from(self.scatter(v)),
            Array::Int64(v) => Array::from(self.scatter(v)),
            Array::Float32(v) => Array::from(self.scatter(v)),
            Array::Float64(v) => Array::from(self.scatter(v)),
            Array::Complex64(v) => Array::from(self.scatter::<Complex<f32>>(v)),
            Array::Complex128(v) => Array::from(self.scatter::<Complex<f64>>(v)),
        };
        DenseMatrix {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    fn scatter<T: Element + Default>(&self, values: &[T]) -> Vec<T> {
        let mut dense = vec![T::default(); self.rows * self.cols];
        for row in 0..self.rows {
            let (start, end) = (self.indptr[row] as usize, self.indptr[row + 1] as usize);
            for k in start..end {
                let col = self.indices[k] as usize;
                dense[col * self.rows + row] = values[k];
            }
        }
        dense
    }
}

/// A workspace matrix, dense or sparse.
#[derive(Debug, Clone)]
pub struct Matrix {
    handle: Handle,
    kind: MatrixKind,
}

impl Matrix {
    pub(crate) fn from_handle(handle: Handle, kind: MatrixKind) -> Self {
        Self { handle, kind }
    }

    pub(crate) fn with_kind(self, kind: MatrixKind) -> Self {
        Self { kind, ..self }
    }

    pub fn kind(&self) -> MatrixKind {
        self.kind
    }

    pub fn rows(&self) -> Result<u64, ClientError> {
        let session = self.handle.session()?;
        Ok(session.scalar_param(&format!("{}_ROWDIM", self.handle.name))? as u64)
    }

    pub fn cols(&self) -> Result<u64, ClientError> {
        let session = self.handle.session()?;
        Ok(session.scalar_param(&format!("{}_COLDIM", self.handle.name))? as u64)
    }

    /// `(rows, cols)` in one metadata round trip.
    pub fn shape(&self) -> Result<(u64, u64), ClientError> {
        let info = self.handle.info()?;
        Ok((info.size1, info.size2))
    }

    /// Whether the engine stores the matrix as symmetric (upper, lower or
    /// diagonal). Engines that do not report a storage layout yield `false`.
    pub fn is_symmetric(&self) -> Result<bool, ClientError> {
        let info = self.handle.info()?;
        match info.mattype {
            Some(mattype) => Ok(mattype <= 2),
            None => {
                tracing::warn!(
                    "Engine does not report the storage layout of {}; assuming unsymmetric",
                    self.handle.name
                );
                Ok(false)
            }
        }
    }

    /// Downloads a dense matrix, or expands a sparse one.
    pub fn download_dense(&self) -> Result<DenseMatrix, ClientError> {
        match self.kind {
            MatrixKind::Dense => {
                let (rows, cols) = self.shape()?;
                let data = self.handle.session()?.mat_data(&self.handle.name)?;
                DenseMatrix::new(rows as usize, cols as usize, data)
            }
            MatrixKind::Sparse => Ok(self.download_csr()?.to_dense()),
        }
    }

    /// Downloads a sparse matrix as CSR with 0-based indices.
    pub fn download_csr(&self) -> Result<CsrMatrix, ClientError> {
        let info = self.handle.info()?;
        if info.objtype != ObjectKind::Smat {
            return Err(ClientError::UnexpectedReply(format!(
                "{} is not a sparse matrix",
                self.handle.name
            )));
        }
        let session = self.handle.session()?;
        let part = |suffix: &str, explicit| {
            session.fetch_vec(&format!("{}::{}", self.handle.name, suffix), explicit)
        };
        let zero_based = |array: Array| -> Result<Vec<i64>, ClientError> {
            array
                .to_i64()
                .map(|v| v.into_iter().map(|i| i - 1).collect())
                .ok_or_else(|| {
                    ClientError::UnexpectedReply("sparse index vector is not integer".to_string())
                })
        };

        let indptr = zero_based(part("ROWS", None)?)?;
        let indices = zero_based(part("COLS", None)?)?;
        let values = part("VALS", Some(info.stype))?;
        CsrMatrix::new(
            info.size1 as usize,
            info.size2 as usize,
            indptr,
            indices,
            values,
        )
    }

    /// Column `j` (0-based) as a vector sharing the matrix storage.
    pub fn column(&self, j: u64) -> Result<Vector, ClientError> {
        let (_, cols) = self.shape()?;
        if j >= cols {
            return Err(ClientError::ShapeMismatch(format!(
                "column {} of a matrix with {} columns",
                j, cols
            )));
        }
        let name = self.handle.fresh_name()?;
        self.handle.run(&format!(
            "*VEC,{},{},LINK,{},{}",
            name,
            self.handle.type_char()?,
            self.handle.name,
            j + 1
        ))?;
        Ok(Vector::from_handle(Handle::new(
            name,
            self.handle.value_type,
            self.handle.weak(),
        )))
    }

    /// Transposed copy.
    pub fn transpose(&self) -> Result<Matrix, ClientError> {
        let handle = self.handle.copy(self.kind.alloc_command(), true)?;
        Ok(Matrix::from_handle(handle, self.kind))
    }

    /// Matrix-vector product as a new vector.
    pub fn dot_vec(&self, x: &Vector) -> Result<Vector, ClientError> {
        let (rows, cols) = self.shape()?;
        let len = x.size()?;
        if len != cols {
            return Err(ClientError::ShapeMismatch(format!(
                "{}x{} matrix times vector of {}",
                rows, cols, len
            )));
        }
        let name = self.handle.fresh_name()?;
        self.handle.run(&format!(
            "*VEC,{},{},ALLOC,{}",
            name,
            self.handle.type_char()?,
            rows
        ))?;
        self.multiply_into(x.name(), &name)?;
        Ok(Vector::from_handle(Handle::new(
            name,
            self.handle.value_type,
            self.handle.weak(),
        )))
    }

    /// Matrix-matrix product as a new dense matrix.
    pub fn dot_mat(&self, other: &Matrix) -> Result<Matrix, ClientError> {
        let (rows, inner) = self.shape()?;
        let (other_rows, cols) = other.shape()?;
        if inner != other_rows {
            return Err(ClientError::ShapeMismatch(format!(
                "{}x{} times {}x{}",
                rows, inner, other_rows, cols
            )));
        }
        let name = self.handle.fresh_name()?;
        self.handle.run(&format!(
            "*DMAT,{},{},ALLOC,{},{}",
            name,
            self.handle.type_char()?,
            rows,
            cols
        ))?;
        self.multiply_into(other.name(), &name)?;
        Ok(Matrix::from_handle(
            Handle::new(name, self.handle.value_type, self.handle.weak()),
            MatrixKind::Dense,
        ))
    }

    fn multiply_into(&self, operand: &str, out: &str) -> Result<(), ClientError> {
        self.handle
            .run(&format!("*MULT,{},,{},,{}", self.handle.name, operand, out))?;
        Ok(())
    }

    /// Factorizes this matrix into a new solver.
    pub fn factorize(&self, options: &FactorizeOptions) -> Result<Solver, ClientError> {
        let name = self.handle.fresh_name()?;
        let mut solver = Solver::from_handle(Handle::new(
            name,
            self.handle.value_type,
            self.handle.weak(),
        ));
        solver.factorize(self, options)?;
        Ok(solver)
    }
}

impl MathObject for Matrix {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn copy(&self) -> Result<Self, ClientError> {
        let handle = self.handle.copy(self.kind.alloc_command(), false)?;
        Ok(Matrix::from_handle(handle, self.kind))
    }
}
