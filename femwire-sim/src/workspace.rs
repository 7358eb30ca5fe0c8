//! Named math objects and the kernels that operate on them.
//!
//! Arithmetic is carried out in `f64` and converted back to the target's
//! element type. Complex objects can be stored, copied and transferred but
//! not computed on.

use crate::error::SimError;
use femwire_protocol::message::{DataInfo, ObjectKind};
use femwire_protocol::{Array, Element, ValueType};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Dense matrix, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMat {
    pub rows: usize,
    pub cols: usize,
    pub data: Array,
}

/// Sparse matrix in CSR form with 0-based indices. A symmetric matrix may
/// hold one triangle only; the mirror is implied.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMat {
    pub rows: usize,
    pub cols: usize,
    pub indptr: Vec<usize>,
    pub indices: Vec<usize>,
    pub values: Array,
    pub symmetric: bool,
}

/// Solver bound to a matrix with `*LSENGINE`.
#[derive(Debug, Clone)]
pub struct LinearSolver {
    pub algo: String,
    pub matrix: String,
    pub factor: Option<LuFactor>,
}

#[derive(Debug, Clone)]
pub enum Object {
    Vector(Array),
    Dense(DenseMat),
    Sparse(SparseMat),
    Solver(LinearSolver),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Vector(_) => ObjectKind::Vec,
            Object::Dense(_) => ObjectKind::Dmat,
            Object::Sparse(_) => ObjectKind::Smat,
            Object::Solver(_) => ObjectKind::Solver,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Object::Vector(v) => v.value_type(),
            Object::Dense(m) => m.data.value_type(),
            Object::Sparse(m) => m.values.value_type(),
            Object::Solver(_) => ValueType::Float64,
        }
    }

    /// Rows and columns. A vector is a single column.
    pub fn dims(&self) -> (usize, usize) {
        match self {
            Object::Vector(v) => (v.len(), 1),
            Object::Dense(m) => (m.rows, m.cols),
            Object::Sparse(m) => (m.rows, m.cols),
            Object::Solver(s) => match &s.factor {
                Some(lu) => (lu.order(), lu.order()),
                None => (0, 0),
            },
        }
    }

    pub fn info(&self, name: &str) -> DataInfo {
        let (size1, size2) = self.dims();
        let mattype = match self {
            Object::Dense(_) => Some(3),
            Object::Sparse(m) if m.symmetric => Some(0),
            Object::Sparse(_) => Some(3),
            _ => None,
        };
        DataInfo {
            name: name.to_string(),
            objtype: self.kind(),
            stype: self.value_type(),
            size1: size1 as u64,
            size2: size2 as u64,
            mattype,
        }
    }

    fn values(&self) -> Option<&Array> {
        match self {
            Object::Vector(v) => Some(v),
            Object::Dense(m) => Some(&m.data),
            Object::Sparse(m) => Some(&m.values),
            Object::Solver(_) => None,
        }
    }

    fn values_mut(&mut self) -> Option<&mut Array> {
        match self {
            Object::Vector(v) => Some(v),
            Object::Dense(m) => Some(&mut m.data),
            Object::Sparse(m) => Some(&mut m.values),
            Object::Solver(_) => None,
        }
    }
}

/// Real view of `array`, or `Unsupported` for complex data.
pub fn real(array: &Array, name: &str) -> Result<Vec<f64>, SimError> {
    array
        .to_f64()
        .ok_or_else(|| SimError::Unsupported(format!("complex arithmetic on {}", name)))
}

/// Converts real values to `value_type`.
pub fn typed(value_type: ValueType, values: &[f64]) -> Result<Array, SimError> {
    Ok(Array::from_f64(value_type, values)?)
}

/// Converts `array` to `value_type`. Complex data only converts to itself.
pub fn convert(array: &Array, value_type: ValueType, name: &str) -> Result<Array, SimError> {
    if array.value_type() == value_type {
        return Ok(array.clone());
    }
    typed(value_type, &real(array, name)?)
}

/// Elements of `array` in the order given by `order`.
fn gather(array: &Array, order: &[usize]) -> Array {
    fn pick<T: Element>(values: &[T], order: &[usize]) -> Array {
        T::into_array(order.iter().map(|&i| values[i]).collect())
    }
    match array {
        Array::Int16(v) => pick(v, order),
        Array::Int32(v) => pick(v, order),
        Array::Int64(v) => pick(v, order),
        Array::Float32(v) => pick(v, order),
        Array::Float64(v) => pick(v, order),
        Array::Complex64(v) => pick(v, order),
        Array::Complex128(v) => pick(v, order),
    }
}

impl DenseMat {
    pub fn zeros(value_type: ValueType, rows: usize, cols: usize) -> Result<Self, SimError> {
        Ok(Self {
            rows,
            cols,
            data: typed(value_type, &vec![0.0; rows * cols])?,
        })
    }

    pub fn transpose(&self) -> Self {
        let order: Vec<usize> = (0..self.rows)
            .flat_map(|i| (0..self.cols).map(move |j| j * self.rows + i))
            .collect();
        Self {
            rows: self.cols,
            cols: self.rows,
            data: gather(&self.data, &order),
        }
    }

    /// Column `j`, 0-based.
    pub fn column(&self, j: usize) -> Array {
        self.data.slice(j * self.rows..(j + 1) * self.rows)
    }

    /// Converts to CSR, dropping entries with magnitude at or below
    /// `threshold`.
    pub fn sparsify(&self, threshold: f64, name: &str) -> Result<SparseMat, SimError> {
        let values = real(&self.data, name)?;
        let mut indptr = Vec::with_capacity(self.rows + 1);
        let mut indices = Vec::new();
        let mut kept = Vec::new();
        indptr.push(0);
        for i in 0..self.rows {
            for j in 0..self.cols {
                let v = values[j * self.rows + i];
                if v.abs() > threshold {
                    indices.push(j);
                    kept.push(v);
                }
            }
            indptr.push(indices.len());
        }
        Ok(SparseMat {
            rows: self.rows,
            cols: self.cols,
            indptr,
            indices,
            values: typed(self.data.value_type(), &kept)?,
            symmetric: false,
        })
    }
}

impl SparseMat {
    /// Validates and builds a CSR matrix.
    pub fn new(
        rows: usize,
        cols: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        values: Array,
        symmetric: bool,
    ) -> Result<Self, SimError> {
        if indptr.len() != rows + 1 {
            return Err(SimError::ShapeMismatch(format!(
                "row pointer has {} entries for {} rows",
                indptr.len(),
                rows
            )));
        }
        if indptr.windows(2).any(|w| w[0] > w[1]) || indptr.first() != Some(&0) {
            return Err(SimError::invalid("row pointer must start at 1 and not decrease"));
        }
        let nnz = indptr[rows];
        if indices.len() != nnz || values.len() != nnz {
            return Err(SimError::ShapeMismatch(format!(
                "{} non-zeros with {} column indices and {} values",
                nnz,
                indices.len(),
                values.len()
            )));
        }
        if indices.iter().any(|&j| j >= cols) {
            return Err(SimError::ShapeMismatch(format!(
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
            symmetric,
        })
    }

    /// Expands to a dense column-major matrix of reals.
    pub fn to_dense(&self, name: &str) -> Result<Vec<f64>, SimError> {
        let values = real(&self.values, name)?;
        let mut dense = vec![0.0; self.rows * self.cols];
        for i in 0..self.rows {
            for k in self.indptr[i]..self.indptr[i + 1] {
                let j = self.indices[k];
                dense[j * self.rows + i] = values[k];
                if self.symmetric && i != j && i < self.cols && j < self.rows {
                    dense[i * self.rows + j] = values[k];
                }
            }
        }
        Ok(dense)
    }

    pub fn transpose(&self) -> Self {
        let mut counts = vec![0usize; self.cols + 1];
        for &j in &self.indices {
            counts[j + 1] += 1;
        }
        for j in 0..self.cols {
            counts[j + 1] += counts[j];
        }
        let indptr = counts.clone();
        let mut next = counts;
        let mut indices = vec![0; self.indices.len()];
        let mut order = vec![0; self.indices.len()];
        for i in 0..self.rows {
            for k in self.indptr[i]..self.indptr[i + 1] {
                let j = self.indices[k];
                let slot = next[j];
                indices[slot] = i;
                order[slot] = k;
                next[j] += 1;
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            indptr,
            indices,
            values: gather(&self.values, &order),
            symmetric: self.symmetric,
        }
    }

    /// 1-based row pointer.
    pub fn rows_one_based(&self) -> Array {
        Array::Int32(self.indptr.iter().map(|&p| p as i32 + 1).collect())
    }

    /// 1-based column indices.
    pub fn cols_one_based(&self) -> Array {
        Array::Int32(self.indices.iter().map(|&j| j as i32 + 1).collect())
    }
}

/// LU factorization with partial pivoting.
#[derive(Debug, Clone)]
pub struct LuFactor {
    name: String,
    lu: LU<f64, Dyn, Dyn>,
}

impl LuFactor {
    /// Factorizes the square column-major matrix `a`.
    ///
    /// A pivot no larger than `max|a| * n * EPSILON` makes the matrix singular.
    pub fn new(n: usize, a: &[f64], name: &str) -> Result<Self, SimError> {
        let matrix = DMatrix::from_column_slice(n, n, a);
        let scale = matrix.amax();
        let tolerance = scale * n as f64 * f64::EPSILON;
        let lu = matrix.lu();
        if lu
            .u()
            .diagonal()
            .iter()
            .any(|pivot| pivot.abs() <= tolerance || !pivot.is_finite())
        {
            return Err(SimError::SingularMatrix(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            lu,
        })
    }

    pub fn order(&self) -> usize {
        self.lu.u().nrows()
    }

    /// Solves `A x = b`.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, SimError> {
        let mut x = DVector::from_column_slice(b);
        if !self.lu.solve_mut(&mut x) {
            return Err(SimError::SingularMatrix(self.name.clone()));
        }
        Ok(x.as_slice().to_vec())
    }
}

/// Computes `A x` for a dense or sparse `A`.
pub fn mat_vec(a: &Object, name: &str, x: &[f64]) -> Result<Vec<f64>, SimError> {
    let (rows, cols) = a.dims();
    if x.len() != cols {
        return Err(SimError::ShapeMismatch(format!(
            "{}x{} matrix times vector of {}",
            rows,
            cols,
            x.len()
        )));
    }
    let dense = match a {
        Object::Dense(m) => real(&m.data, name)?,
        Object::Sparse(m) => m.to_dense(name)?,
        _ => return Err(SimError::invalid(format!("{} is not a matrix", name))),
    };
    let y = DMatrix::from_column_slice(rows, cols, &dense) * DVector::from_column_slice(x);
    Ok(y.as_slice().to_vec())
}

/// Real column-major contents of a dense or sparse matrix.
pub fn dense_values(a: &Object, name: &str) -> Result<Vec<f64>, SimError> {
    match a {
        Object::Dense(m) => real(&m.data, name),
        Object::Sparse(m) => m.to_dense(name),
        _ => Err(SimError::invalid(format!("{} is not a matrix", name))),
    }
}

/// Norm kinds of `*NRM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Norm {
    Two,
    One,
    Inf,
}

impl Norm {
    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s.to_ascii_uppercase().as_str() {
            "NRM2" | "" => Ok(Norm::Two),
            "NRM1" => Ok(Norm::One),
            "NRMINF" => Ok(Norm::Inf),
            other => Err(SimError::invalid(format!("unknown norm {}", other))),
        }
    }

    pub fn apply(self, values: &[f64]) -> f64 {
        match self {
            Norm::Two => values.iter().map(|v| v * v).sum::<f64>().sqrt(),
            Norm::One => values.iter().map(|v| v.abs()).sum(),
            Norm::Inf => values.iter().fold(0.0, |m, v| m.max(v.abs())),
        }
    }
}

/// The named object store of one engine session.
#[derive(Debug, Default)]
pub struct Workspace {
    objects: BTreeMap<String, Object>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Object, SimError> {
        self.objects
            .get(name)
            .ok_or_else(|| SimError::NotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Object, SimError> {
        self.objects
            .get_mut(name)
            .ok_or_else(|| SimError::NotFound(name.to_string()))
    }

    /// Stores `object` under `name`, replacing any previous object.
    pub fn insert(&mut self, name: impl Into<String>, object: Object) {
        self.objects.insert(name.into(), object);
    }

    pub fn remove(&mut self, name: &str) -> Result<Object, SimError> {
        self.objects
            .remove(name)
            .ok_or_else(|| SimError::NotFound(name.to_string()))
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn vector(&self, name: &str) -> Result<&Array, SimError> {
        match self.get(name)? {
            Object::Vector(v) => Ok(v),
            other => Err(SimError::invalid(format!(
                "{} is a {:?}, not a vector",
                name,
                other.kind()
            ))),
        }
    }

    /// Real contents of a vector or matrix.
    pub fn real_values(&self, name: &str) -> Result<Vec<f64>, SimError> {
        let object = self.get(name)?;
        let values = object
            .values()
            .ok_or_else(|| SimError::invalid(format!("{} holds no values", name)))?;
        real(values, name)
    }

    /// Overwrites the values of `name` with `values`, keeping its type.
    pub fn store_values(&mut self, name: &str, values: &[f64]) -> Result<(), SimError> {
        let target = self
            .get_mut(name)?
            .values_mut()
            .ok_or_else(|| SimError::invalid(format!("{} holds no values", name)))?;
        if target.len() != values.len() {
            return Err(SimError::ShapeMismatch(format!(
                "{} has {} values, got {}",
                name,
                target.len(),
                values.len()
            )));
        }
        *target = typed(target.value_type(), values)?;
        Ok(())
    }

    /// Copy of `source` converted to `value_type`, transposed on request.
    pub fn copy_of(
        &self,
        source: &str,
        value_type: ValueType,
        transpose: bool,
    ) -> Result<Object, SimError> {
        Ok(match self.get(source)? {
            Object::Vector(v) => Object::Vector(convert(v, value_type, source)?),
            Object::Dense(m) => {
                let m = if transpose { m.transpose() } else { m.clone() };
                Object::Dense(DenseMat {
                    data: convert(&m.data, value_type, source)?,
                    ..m
                })
            }
            Object::Sparse(m) => {
                let m = if transpose { m.transpose() } else { m.clone() };
                Object::Sparse(SparseMat {
                    values: convert(&m.values, value_type, source)?,
                    ..m
                })
            }
            Object::Solver(_) => {
                return Err(SimError::invalid(format!("cannot copy solver {}", source)))
            }
        })
    }

    /// Listing of every object, one per line.
    pub fn status(&self) -> String {
        let mut out = String::from("APDLMATH PARAMETER STATUS\n");
        let _ = writeln!(out, "  {:<24}{:<8}{:<12}{:>10}{:>10}", "Name", "Kind", "Type", "Rows", "Cols");
        for (name, object) in &self.objects {
            let (rows, cols) = object.dims();
            let _ = writeln!(
                out,
                "  {:<24}{:<8}{:<12}{:>10}{:>10}",
                name,
                format!("{:?}", object.kind()).to_ascii_uppercase(),
                object.value_type().name(),
                rows,
                cols
            );
        }
        out
    }

    /// Human-readable dump of one object.
    pub fn render(&self, name: &str) -> Result<String, SimError> {
        let object = self.get(name)?;
        let mut out = String::new();
        let (rows, cols) = object.dims();
        let _ = writeln!(
            out,
            "{} {} {}x{} {}",
            name,
            format!("{:?}", object.kind()).to_ascii_uppercase(),
            rows,
            cols,
            object.value_type().name()
        );
        match object {
            Object::Vector(v) => {
                for (i, value) in real(v, name)?.iter().enumerate() {
                    let _ = writeln!(out, "  {:>8}  {:.6e}", i + 1, value);
                }
            }
            Object::Dense(_) | Object::Sparse(_) => {
                let values = dense_values(object, name)?;
                for i in 0..rows {
                    let row: Vec<String> = (0..cols)
                        .map(|j| format!("{:.6e}", values[j * rows + i]))
                        .collect();
                    let _ = writeln!(out, "  {}", row.join("  "));
                }
            }
            Object::Solver(s) => {
                let _ = writeln!(
                    out,
                    "  {} on {} ({})",
                    s.algo,
                    s.matrix,
                    if s.factor.is_some() { "factorized" } else { "not factorized" }
                );
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dense(rows: usize, cols: usize, col_major: Vec<f64>) -> DenseMat {
        DenseMat {
            rows,
            cols,
            data: Array::from(col_major),
        }
    }

    #[test]
    fn test_dense_transpose() {
        // [[1, 2, 3], [4, 5, 6]]
        let m = dense(2, 3, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let t = m.transpose();
        assert_eq!((t.rows, t.cols), (3, 2));
        assert_eq!(t.data, Array::from(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        assert_eq!(t.column(1), Array::from(vec![4.0, 5.0, 6.0]));
    }

    #[test]
    fn test_sparsify_and_expand() {
        let m = dense(2, 2, vec![1.0, 0.0, 1e-12, 3.0]);
        let s = m.sparsify(1e-9, "M").unwrap();
        assert_eq!(s.indptr, vec![0, 1, 2]);
        assert_eq!(s.indices, vec![0, 1]);
        assert_eq!(s.to_dense("M").unwrap(), vec![1.0, 0.0, 0.0, 3.0]);
        assert_eq!(s.rows_one_based(), Array::Int32(vec![1, 2, 3]));
    }

    #[test]
    fn test_symmetric_triangle_mirrors() {
        // upper triangle of [[2, 1], [1, 2]]
        let s = SparseMat::new(
            2,
            2,
            vec![0, 2, 3],
            vec![0, 1, 1],
            Array::from(vec![2.0, 1.0, 2.0]),
            true,
        )
        .unwrap();
        assert_eq!(s.to_dense("S").unwrap(), vec![2.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_sparse_validation() {
        let bad_ptr = SparseMat::new(2, 2, vec![0, 1], vec![0], Array::from(vec![1.0]), false);
        assert!(matches!(bad_ptr, Err(SimError::ShapeMismatch(_))));
        let bad_col = SparseMat::new(1, 1, vec![0, 1], vec![3], Array::from(vec![1.0]), false);
        assert!(matches!(bad_col, Err(SimError::ShapeMismatch(_))));
    }

    #[test]
    fn test_sparse_transpose() {
        // [[1, 2], [0, 3]]
        let s = SparseMat::new(
            2,
            2,
            vec![0, 2, 3],
            vec![0, 1, 1],
            Array::from(vec![1.0, 2.0, 3.0]),
            false,
        )
        .unwrap();
        let t = s.transpose();
        assert_eq!(t.to_dense("T").unwrap(), vec![1.0, 2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_lu_solve() {
        // [[0, 2], [3, 1]] needs a row swap
        let lu = LuFactor::new(2, &[0.0, 3.0, 2.0, 1.0], "K").unwrap();
        let x = lu.solve(&[4.0, 5.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_lu_singular() {
        let err = LuFactor::new(2, &[1.0, 2.0, 2.0, 4.0], "K").unwrap_err();
        assert!(matches!(err, SimError::SingularMatrix(name) if name == "K"));
    }

    #[test]
    fn test_solver_dims_follow_factor() {
        let lu = LuFactor::new(3, &[2.0, 0.0, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 4.0], "K").unwrap();
        assert_eq!(lu.order(), 3);
        let solver = Object::Solver(LinearSolver {
            algo: "LAPACK".to_string(),
            matrix: "K".to_string(),
            factor: Some(lu),
        });
        assert_eq!(solver.dims(), (3, 3));
        assert_eq!(solver.info("S").size1, 3);
    }

    #[test]
    fn test_complex_copy_but_no_arithmetic() {
        let mut ws = Workspace::new();
        let z = Array::Complex128(vec![femwire_protocol::Complex::new(1.0, 2.0)]);
        ws.insert("Z", Object::Vector(z.clone()));
        let copy = ws.copy_of("Z", ValueType::Complex128, false).unwrap();
        assert!(matches!(copy, Object::Vector(v) if v == z));
        assert!(matches!(ws.real_values("Z"), Err(SimError::Unsupported(_))));
        assert!(matches!(
            ws.copy_of("Z", ValueType::Float64, false),
            Err(SimError::Unsupported(_))
        ));
    }

    #[test]
    fn test_info() {
        let mut ws = Workspace::new();
        ws.insert("V", Object::Vector(Array::Int32(vec![1, 2, 3])));
        ws.insert("M", Object::Dense(DenseMat::zeros(ValueType::Float32, 2, 4).unwrap()));
        let v = ws.get("V").unwrap().info("V");
        assert_eq!((v.objtype, v.stype, v.size1, v.size2), (ObjectKind::Vec, ValueType::Int32, 3, 1));
        assert_eq!(v.mattype, None);
        let m = ws.get("M").unwrap().info("M");
        assert_eq!((m.size1, m.size2, m.mattype), (2, 4, Some(3)));
        assert!(ws.status().contains("V"));
        assert!(matches!(ws.get("X"), Err(SimError::NotFound(_))));
    }

    proptest! {
        #[test]
        fn prop_lu_recovers_solution(
            diag in prop::collection::vec(5.0f64..10.0, 1..6),
            off in prop::collection::vec(-1.0f64..1.0, 36),
            x in prop::collection::vec(-10.0f64..10.0, 6),
        ) {
            // diagonally dominant, so never singular
            let n = diag.len();
            let mut a = vec![0.0; n * n];
            for i in 0..n {
                for j in 0..n {
                    a[j * n + i] = if i == j { diag[i] } else { off[i * 6 + j] };
                }
            }
            let x = &x[..n];
            let b: Vec<f64> = (0..n).map(|i| (0..n).map(|j| a[j * n + i] * x[j]).sum()).collect();
            let solved = LuFactor::new(n, &a, "A").unwrap().solve(&b).unwrap();
            for (s, e) in solved.iter().zip(x) {
                prop_assert!((s - e).abs() < 1e-8);
            }
        }
    }
}
