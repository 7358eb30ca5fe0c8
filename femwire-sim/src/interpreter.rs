//! Command interpreter.
//!
//! An [`Engine`] owns one session's state (math workspace, FE model,
//! scalar parameters and stored files) and executes the comma-separated
//! command language the client speaks. Names and keywords are
//! case-insensitive; object and parameter names are stored uppercase.

use crate::config::EngineConfig;
use crate::error::SimError;
use crate::model::{Entity, Model, SelectMode};
use crate::workspace::{
    convert, dense_values, mat_vec, real, typed, DenseMat, LinearSolver, LuFactor, Norm, Object,
    SparseMat, Workspace,
};
use bytes::Bytes;
use femwire_protocol::message::{DataInfo, GetParams, ScalarValue, VgetParams};
use femwire_protocol::{Array, Shape, ValueType};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// One session's engine state.
#[derive(Debug)]
pub struct Engine {
    workspace: Workspace,
    model: Model,
    params: BTreeMap<String, f64>,
    files: BTreeMap<String, Bytes>,
    /// Seeded generator for `*INIT,..,RAND`.
    rng: ChaCha8Rng,
}

/// Comma-separated fields of one command, trimmed.
struct Args<'a> {
    fields: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn new(command: &'a str) -> Self {
        Self {
            fields: command.split(',').map(str::trim).collect(),
        }
    }

    fn keyword(&self) -> String {
        self.fields[0].to_ascii_uppercase()
    }

    /// Field `i`, empty when absent.
    fn get(&self, i: usize) -> &'a str {
        self.fields.get(i).copied().unwrap_or("")
    }

    fn upper(&self, i: usize) -> String {
        self.get(i).to_ascii_uppercase()
    }

    /// Field `i` as an object or parameter name.
    fn name(&self, i: usize) -> Result<String, SimError> {
        let name = self.upper(i);
        if name.is_empty() {
            return Err(SimError::invalid(format!(
                "{} needs a name in field {}",
                self.fields[0], i
            )));
        }
        Ok(name)
    }

    fn number(&self, i: usize) -> Result<f64, SimError> {
        parse_number(self.get(i))
    }

    /// Field `i` as a number, `default` when empty.
    fn number_or(&self, i: usize, default: f64) -> Result<f64, SimError> {
        match self.get(i) {
            "" => Ok(default),
            s => parse_number(s),
        }
    }

    fn int(&self, i: usize) -> Result<i32, SimError> {
        to_int(self.number(i)?)
    }

    fn int_or(&self, i: usize, default: i32) -> Result<i32, SimError> {
        to_int(self.number_or(i, default as f64)?)
    }

    fn count(&self, i: usize) -> Result<usize, SimError> {
        let n = self.int(i)?;
        usize::try_from(n).map_err(|_| SimError::invalid(format!("negative size {}", n)))
    }

    fn value_type(&self, i: usize) -> Result<ValueType, SimError> {
        let field = self.get(i);
        let mut chars = field.chars();
        match (chars.next(), chars.next()) {
            (None, _) => Ok(ValueType::Float64),
            (Some(c), None) => ValueType::from_type_char(c)
                .ok_or_else(|| SimError::invalid(format!("unknown value type {}", field))),
            _ => Err(SimError::invalid(format!("unknown value type {}", field))),
        }
    }

    fn len(&self) -> usize {
        self.fields.len()
    }
}

fn parse_number(s: &str) -> Result<f64, SimError> {
    s.parse::<f64>()
        .map_err(|_| SimError::invalid(format!("expected a number, got '{}'", s)))
}

fn to_int(v: f64) -> Result<i32, SimError> {
    if v.fract() != 0.0 || v.abs() > i32::MAX as f64 {
        return Err(SimError::invalid(format!("expected an integer, got {}", v)));
    }
    Ok(v as i32)
}

impl Engine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            workspace: Workspace::new(),
            model: Model::new(),
            params: BTreeMap::new(),
            files: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Executes one command and returns its output text.
    pub fn run(&mut self, command: &str) -> Result<String, SimError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SimError::invalid("empty command"));
        }
        if command.contains('\n') || command.contains('\r') {
            return Err(SimError::invalid("command spans several lines"));
        }

        let head = command.split(',').next().unwrap_or_default();
        if head.contains('=') && !head.starts_with('*') && !head.starts_with('/') {
            return self.assign(command);
        }

        let args = Args::new(command);
        match args.keyword().as_str() {
            "*VEC" => self.vec_cmd(&args),
            "*DMAT" => self.dmat_cmd(&args),
            "*SMAT" => self.smat_cmd(&args),
            "*INIT" => self.init_cmd(&args),
            "*AXPY" => self.axpy_cmd(&args),
            "*SCAL" => self.scal_cmd(&args),
            "*NRM" => self.nrm_cmd(&args),
            "*DOT" => self.dot_cmd(&args),
            "*HPROD" => self.hprod_cmd(&args),
            "*MULT" => self.mult_cmd(&args),
            "*COMP" => self.comp_cmd(&args),
            "*LSENGINE" => self.lsengine_cmd(&args),
            "*LSFACTOR" => self.lsfactor_cmd(&args),
            "*LSBAC" => self.lsbac_cmd(&args),
            "*FREE" => self.free_cmd(&args),
            "*STATUS" => Ok(self.workspace.status()),
            "*PRINT" => self.workspace.render(&args.name(1)?),
            "*GET" => self.get_cmd(&args),
            "*EIG" => Err(SimError::Unsupported("eigen-solves".to_string())),
            "/PREP7" | "/SOLU" | "FINISH" | "ANTYPE" | "MODOPT" => Ok(String::new()),
            "/CLEAR" => {
                self.workspace.clear();
                self.model.clear();
                self.params.clear();
                Ok("DATABASE CLEARED".to_string())
            }
            _ => self.model_cmd(&args),
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// `NAME=expr` where expr is a number, a parameter or `VEC(i)`.
    fn assign(&mut self, command: &str) -> Result<String, SimError> {
        let (lhs, rhs) = command
            .split_once('=')
            .ok_or_else(|| SimError::invalid("malformed assignment"))?;
        let name = lhs.trim().to_ascii_uppercase();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(SimError::invalid(format!("bad parameter name '{}'", lhs)));
        }
        let value = self.evaluate(rhs.trim())?;
        self.params.insert(name.clone(), value);
        Ok(format!("PARAMETER {} = {}", name, value))
    }

    fn evaluate(&self, expr: &str) -> Result<f64, SimError> {
        if let Ok(v) = expr.parse::<f64>() {
            return Ok(v);
        }
        if let Some((name, rest)) = expr.split_once('(') {
            let index = rest
                .strip_suffix(')')
                .ok_or_else(|| SimError::invalid(format!("malformed expression '{}'", expr)))?;
            let name = name.trim().to_ascii_uppercase();
            let index = to_int(parse_number(index.trim())?)?;
            let values = real(self.workspace.vector(&name)?, &name)?;
            return usize::try_from(index - 1)
                .ok()
                .and_then(|i| values.get(i).copied())
                .ok_or_else(|| {
                    SimError::ShapeMismatch(format!(
                        "index {} of {} with {} values",
                        index,
                        name,
                        values.len()
                    ))
                });
        }
        self.parameter(expr)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| SimError::NotFound(format!("parameter {}", expr)))
    }

    /// Looks up a scalar parameter. `<obj>_DIM`, `<obj>_ROWDIM` and
    /// `<obj>_COLDIM` resolve to the sizes of workspace objects.
    pub fn parameter(&self, name: &str) -> Option<ScalarValue> {
        let name = name.trim().to_ascii_uppercase();
        if let Some(v) = self.params.get(&name) {
            return Some(ScalarValue::Number(*v));
        }
        let sized = |suffix: &str| {
            name.strip_suffix(suffix)
                .and_then(|obj| self.workspace.get(obj).ok())
                .map(|o| o.dims())
        };
        if let Some((rows, _)) = sized("_ROWDIM") {
            return Some(ScalarValue::Number(rows as f64));
        }
        if let Some((_, cols)) = sized("_COLDIM") {
            return Some(ScalarValue::Number(cols as f64));
        }
        if let Some((rows, _)) = sized("_DIM") {
            return Some(ScalarValue::Number(rows as f64));
        }
        None
    }

    /// `*GET` query.
    pub fn get(&self, params: &GetParams) -> Result<Option<ScalarValue>, SimError> {
        let entity = params.entity.trim().to_ascii_uppercase();
        let entnum = params.entnum.trim();
        let item1 = params.item1.trim().to_ascii_uppercase();
        let it1num = params.it1num.trim().to_ascii_uppercase();

        let number = |v: f64| Ok(Some(ScalarValue::Number(v)));
        match (entity.as_str(), item1.as_str()) {
            ("NODE", "COUNT") => number(self.model.node_count() as f64),
            ("ELEM", "COUNT") => number(self.model.element_count() as f64),
            ("NODE", "NUM") if it1num == "MAX" => number(self.model.max_node() as f64),
            ("ELEM", "NUM") if it1num == "MAX" => number(self.model.max_element() as f64),
            ("NODE", "LOC") => {
                let node = to_int(parse_number(entnum)?)?;
                let axis = match it1num.as_str() {
                    "X" => 0,
                    "Y" => 1,
                    "Z" => 2,
                    other => return Err(SimError::invalid(format!("unknown axis {}", other))),
                };
                Ok(self
                    .model
                    .node_location(node)
                    .map(|xyz| ScalarValue::Number(xyz[axis])))
            }
            ("PARM", _) => Ok(self.parameter(entnum)),
            _ => Err(SimError::invalid(format!(
                "unsupported *GET {},{},{},{}",
                entity, entnum, item1, it1num
            ))),
        }
    }

    /// `*GET,par,entity,entnum,item1,it1num`
    fn get_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let par = args.name(1)?;
        let query = GetParams {
            entity: args.get(2).to_string(),
            entnum: args.get(3).to_string(),
            item1: args.get(4).to_string(),
            it1num: args.get(5).to_string(),
        };
        let value = self
            .get(&query)?
            .and_then(|v| v.as_f64())
            .ok_or_else(|| SimError::NotFound(format!("no value for {}", par)))?;
        self.params.insert(par.clone(), value);
        Ok(format!("PARAMETER {} = {}", par, value))
    }

    // ------------------------------------------------------------------
    // Allocation and copies
    // ------------------------------------------------------------------

    /// `*VEC,name,T,ALLOC,size` | `COPY,src` | `LINK,mat,col`
    fn vec_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let value_type = args.value_type(2)?;
        let object = match args.upper(3).as_str() {
            "ALLOC" => Object::Vector(typed(value_type, &vec![0.0; args.count(4)?])?),
            "COPY" => {
                let src = args.name(4)?;
                self.expect_kind(&src, "vector", |o| matches!(o, Object::Vector(_)))?;
                self.workspace.copy_of(&src, value_type, false)?
            }
            "LINK" => {
                let mat = args.name(4)?;
                let col = args.count(5)?;
                let m = match self.workspace.get(&mat)? {
                    Object::Dense(m) => m,
                    _ => return Err(SimError::invalid(format!("{} is not a dense matrix", mat))),
                };
                if col == 0 || col > m.cols {
                    return Err(SimError::ShapeMismatch(format!(
                        "column {} of a matrix with {} columns",
                        col, m.cols
                    )));
                }
                Object::Vector(convert(&m.column(col - 1), value_type, &mat)?)
            }
            "IMPORT" => return Err(SimError::Unsupported("vector import".to_string())),
            other => return Err(SimError::invalid(format!("unknown *VEC method {}", other))),
        };
        let size = object.dims().0;
        self.workspace.insert(name.clone(), object);
        Ok(format!("VECTOR {} CREATED, SIZE {}", name, size))
    }

    /// `*DMAT,name,T,ALLOC,rows,cols` | `COPY,src[,TRANS]`
    fn dmat_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let value_type = args.value_type(2)?;
        let object = match args.upper(3).as_str() {
            "ALLOC" => Object::Dense(DenseMat::zeros(value_type, args.count(4)?, args.count(5)?)?),
            "COPY" => {
                let src = args.name(4)?;
                self.expect_kind(&src, "dense matrix", |o| matches!(o, Object::Dense(_)))?;
                self.workspace
                    .copy_of(&src, value_type, args.upper(5) == "TRANS")?
            }
            "IMPORT" => return Err(SimError::Unsupported("dense matrix import".to_string())),
            other => return Err(SimError::invalid(format!("unknown *DMAT method {}", other))),
        };
        let (rows, cols) = object.dims();
        self.workspace.insert(name.clone(), object);
        Ok(format!("DENSE MATRIX {} CREATED, {}x{}", name, rows, cols))
    }

    /// `*SMAT,name,T,ALLOC,CSR,ptr,ind,data,sym` | `COPY,src[,TRANS]`
    fn smat_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let value_type = args.value_type(2)?;
        let object = match args.upper(3).as_str() {
            "ALLOC" => {
                if args.upper(4) != "CSR" {
                    return Err(SimError::Unsupported(format!(
                        "sparse allocation from {}",
                        args.get(4)
                    )));
                }
                let indptr = self.index_vector(&args.name(5)?)?;
                let indices = self.index_vector(&args.name(6)?)?;
                let data = args.name(7)?;
                let values =
                    convert(self.workspace.vector(&data)?, value_type, &data)?;
                let symmetric = matches!(args.upper(8).as_str(), "TRUE" | "1" | "YES");
                let rows = indptr.len().saturating_sub(1);
                Object::Sparse(SparseMat::new(rows, rows, indptr, indices, values, symmetric)?)
            }
            "COPY" => {
                let src = args.name(4)?;
                self.expect_kind(&src, "sparse matrix", |o| matches!(o, Object::Sparse(_)))?;
                self.workspace
                    .copy_of(&src, value_type, args.upper(5) == "TRANS")?
            }
            "IMPORT" => return Err(SimError::Unsupported("sparse matrix import".to_string())),
            other => return Err(SimError::invalid(format!("unknown *SMAT method {}", other))),
        };
        let (rows, cols) = object.dims();
        self.workspace.insert(name.clone(), object);
        Ok(format!("SPARSE MATRIX {} CREATED, {}x{}", name, rows, cols))
    }

    /// A 1-based integer vector as 0-based indices.
    fn index_vector(&self, name: &str) -> Result<Vec<usize>, SimError> {
        let values = self
            .workspace
            .vector(name)?
            .to_i64()
            .ok_or_else(|| SimError::invalid(format!("{} is not an integer vector", name)))?;
        values
            .into_iter()
            .map(|i| {
                usize::try_from(i - 1)
                    .map_err(|_| SimError::invalid(format!("index {} in {} is not 1-based", i, name)))
            })
            .collect()
    }

    fn expect_kind(
        &self,
        name: &str,
        what: &str,
        check: impl Fn(&Object) -> bool,
    ) -> Result<(), SimError> {
        if check(self.workspace.get(name)?) {
            Ok(())
        } else {
            Err(SimError::invalid(format!("{} is not a {}", name, what)))
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    /// `*INIT,name,ZERO|CONST,v|RAND`
    fn init_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let len = match self.workspace.get(&name)? {
            Object::Vector(v) => v.len(),
            Object::Dense(m) => m.data.len(),
            Object::Sparse(m) => m.values.len(),
            Object::Solver(_) => return Err(SimError::invalid(format!("cannot fill solver {}", name))),
        };
        let values = match args.upper(2).as_str() {
            "ZERO" => vec![0.0; len],
            "CONST" => vec![args.number_or(3, 0.0)?; len],
            "RAND" => (0..len).map(|_| self.rng.gen::<f64>()).collect(),
            other => return Err(SimError::invalid(format!("unknown *INIT method {}", other))),
        };
        self.workspace.store_values(&name, &values)?;
        Ok(String::new())
    }

    /// `*AXPY,a,ai,x,b,bi,y`: `y = a x + b y`.
    fn axpy_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let a = args.number(1)?;
        let x_name = args.name(3)?;
        let b = args.number(4)?;
        let y_name = args.name(6)?;

        let x = self.workspace.get(&x_name)?;
        let y = self.workspace.get(&y_name)?;
        if x.dims() != y.dims() {
            return Err(SimError::ShapeMismatch(format!(
                "{} is {:?}, {} is {:?}",
                x_name,
                x.dims(),
                y_name,
                y.dims()
            )));
        }
        let (xv, yv) = match (x, y) {
            (Object::Vector(_), Object::Vector(_)) | (Object::Dense(_), Object::Dense(_)) => (
                self.workspace.real_values(&x_name)?,
                self.workspace.real_values(&y_name)?,
            ),
            (Object::Sparse(xs), Object::Sparse(ys))
                if xs.indptr == ys.indptr && xs.indices == ys.indices =>
            {
                (real(&xs.values, &x_name)?, real(&ys.values, &y_name)?)
            }
            _ => {
                return Err(SimError::Unsupported(format!(
                    "*AXPY between {:?} {} and {:?} {}",
                    x.kind(),
                    x_name,
                    y.kind(),
                    y_name
                )))
            }
        };
        let out: Vec<f64> = xv.iter().zip(&yv).map(|(x, y)| a * x + b * y).collect();
        self.workspace.store_values(&y_name, &out)?;
        Ok(String::new())
    }

    /// `*SCAL,name,v`
    fn scal_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let factor = args.number(2)?;
        let values: Vec<f64> = self
            .workspace
            .real_values(&name)?
            .into_iter()
            .map(|v| v * factor)
            .collect();
        self.workspace.store_values(&name, &values)?;
        Ok(String::new())
    }

    /// `*NRM,name,kind,par`
    fn nrm_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let norm = Norm::parse(args.get(2))?;
        let par = args.name(3)?;
        let value = norm.apply(&self.workspace.real_values(&name)?);
        self.params.insert(par.clone(), value);
        Ok(format!("PARAMETER {} = {}", par, value))
    }

    /// `*DOT,a,b,par`
    fn dot_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let a = args.name(1)?;
        let b = args.name(2)?;
        let par = args.name(3)?;
        let av = real(self.workspace.vector(&a)?, &a)?;
        let bv = real(self.workspace.vector(&b)?, &b)?;
        if av.len() != bv.len() {
            return Err(SimError::ShapeMismatch(format!(
                "vectors have sizes {} and {}",
                av.len(),
                bv.len()
            )));
        }
        let value: f64 = av.iter().zip(&bv).map(|(x, y)| x * y).sum();
        self.params.insert(par.clone(), value);
        Ok(format!("PARAMETER {} = {}", par, value))
    }

    /// `*HPROD,a,b,c`: `c = a .* b`, allocating `c` when missing.
    fn hprod_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let a = args.name(1)?;
        let b = args.name(2)?;
        let c = args.name(3)?;
        let av = real(self.workspace.vector(&a)?, &a)?;
        let bv = real(self.workspace.vector(&b)?, &b)?;
        if av.len() != bv.len() {
            return Err(SimError::ShapeMismatch(format!(
                "vectors have sizes {} and {}",
                av.len(),
                bv.len()
            )));
        }
        let product: Vec<f64> = av.iter().zip(&bv).map(|(x, y)| x * y).collect();
        self.store_result(&c, Object::Vector(typed(ValueType::Float64, &product)?), &product)
    }

    /// `*MULT,a,atrans,b,btrans,c`
    fn mult_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let a_name = args.name(1)?;
        let b_name = args.name(3)?;
        let c_name = args.name(5)?;
        let a_trans = args.upper(2) == "TRANS";
        let b_trans = args.upper(4) == "TRANS";

        let a = self.workspace.get(&a_name)?;
        let a_owned;
        let a = if a_trans {
            a_owned = self.workspace.copy_of(&a_name, a.value_type(), true)?;
            &a_owned
        } else {
            a
        };

        match self.workspace.get(&b_name)? {
            Object::Vector(x) => {
                let y = mat_vec(a, &a_name, &real(x, &b_name)?)?;
                self.store_result(&c_name, Object::Vector(typed(ValueType::Float64, &y)?), &y)
            }
            b @ (Object::Dense(_) | Object::Sparse(_)) => {
                let b_owned;
                let b = if b_trans {
                    b_owned = self.workspace.copy_of(&b_name, b.value_type(), true)?;
                    &b_owned
                } else {
                    b
                };
                let (rows, inner) = a.dims();
                let (b_rows, cols) = b.dims();
                if inner != b_rows {
                    return Err(SimError::ShapeMismatch(format!(
                        "{}x{} times {}x{}",
                        rows, inner, b_rows, cols
                    )));
                }
                let bv = dense_values(b, &b_name)?;
                let mut out = Vec::with_capacity(rows * cols);
                for j in 0..cols {
                    out.extend(mat_vec(a, &a_name, &bv[j * inner..(j + 1) * inner])?);
                }
                let fresh = Object::Dense(DenseMat {
                    rows,
                    cols,
                    data: typed(ValueType::Float64, &out)?,
                });
                self.store_result(&c_name, fresh, &out)
            }
            Object::Solver(_) => Err(SimError::invalid(format!("{} is a solver", b_name))),
        }
    }

    /// Writes `values` into an existing `name` of matching shape, or stores
    /// `fresh` when `name` is absent.
    fn store_result(&mut self, name: &str, fresh: Object, values: &[f64]) -> Result<String, SimError> {
        match self.workspace.get(name) {
            Ok(existing) => {
                if existing.dims() != fresh.dims() {
                    return Err(SimError::ShapeMismatch(format!(
                        "result is {:?}, {} is {:?}",
                        fresh.dims(),
                        name,
                        existing.dims()
                    )));
                }
                self.workspace.store_values(name, values)?;
            }
            Err(_) => self.workspace.insert(name, fresh),
        }
        Ok(String::new())
    }

    /// `*COMP,mat,SPARSE,thresh`. Other methods are not available.
    fn comp_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        match args.upper(2).as_str() {
            "SPARSE" => {
                let threshold = args.number_or(3, 0.0)?;
                let sparse = match self.workspace.get(&name)? {
                    Object::Dense(m) => m.sparsify(threshold, &name)?,
                    _ => return Err(SimError::invalid(format!("{} is not a dense matrix", name))),
                };
                let nnz = sparse.indices.len();
                self.workspace.insert(name.clone(), Object::Sparse(sparse));
                Ok(format!("MATRIX {} CONVERTED TO SPARSE, {} NON-ZEROS", name, nnz))
            }
            "SVD" | "MGS" => Err(SimError::Unsupported(format!("*COMP,{}", args.upper(2)))),
            other => Err(SimError::invalid(format!("unknown *COMP method {}", other))),
        }
    }

    // ------------------------------------------------------------------
    // Linear solves
    // ------------------------------------------------------------------

    /// `*LSENGINE,algo,solver,mat`
    fn lsengine_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let algo = args.upper(1);
        if !matches!(algo.as_str(), "LAPACK" | "DSP" | "BCS") {
            return Err(SimError::Unsupported(format!("solver package {}", algo)));
        }
        let name = args.name(2)?;
        let matrix = args.name(3)?;
        self.expect_kind(&matrix, "matrix", |o| {
            matches!(o, Object::Dense(_) | Object::Sparse(_))
        })?;
        self.workspace.insert(
            name.clone(),
            Object::Solver(LinearSolver {
                algo,
                matrix,
                factor: None,
            }),
        );
        Ok(String::new())
    }

    /// `*LSFACTOR,solver`
    fn lsfactor_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let matrix = match self.workspace.get(&name)? {
            Object::Solver(s) => s.matrix.clone(),
            _ => return Err(SimError::invalid(format!("{} is not a solver", name))),
        };
        let a = self.workspace.get(&matrix)?;
        let (rows, cols) = a.dims();
        if rows != cols {
            return Err(SimError::ShapeMismatch(format!(
                "cannot factorize {}x{} matrix {}",
                rows, cols, matrix
            )));
        }
        let factor = LuFactor::new(rows, &dense_values(a, &matrix)?, &matrix)?;
        tracing::debug!("Factorized {} ({}x{}) into {}", matrix, rows, cols, name);
        if let Object::Solver(s) = self.workspace.get_mut(&name)? {
            s.factor = Some(factor);
        }
        Ok(String::new())
    }

    /// `*LSBAC,solver,b,x`
    fn lsbac_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        let b = args.name(2)?;
        let x = args.name(3)?;
        let factor = match self.workspace.get(&name)? {
            Object::Solver(LinearSolver {
                factor: Some(f), ..
            }) => f,
            Object::Solver(_) => {
                return Err(SimError::invalid(format!("solver {} is not factorized", name)))
            }
            _ => return Err(SimError::invalid(format!("{} is not a solver", name))),
        };
        let rhs = real(self.workspace.vector(&b)?, &b)?;
        if rhs.len() != factor.order() {
            return Err(SimError::ShapeMismatch(format!(
                "right-hand side of {} for order {}",
                rhs.len(),
                factor.order()
            )));
        }
        let solution = factor.solve(&rhs)?;
        self.store_result(&x, Object::Vector(typed(ValueType::Float64, &solution)?), &solution)
    }

    /// `*FREE,name|ALL`
    fn free_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let name = args.name(1)?;
        if name == "ALL" {
            let n = self.workspace.len();
            self.workspace.clear();
            return Ok(format!("{} OBJECTS DELETED", n));
        }
        self.workspace.remove(&name)?;
        Ok(String::new())
    }

    // ------------------------------------------------------------------
    // Model
    // ------------------------------------------------------------------

    fn model_cmd(&mut self, args: &Args) -> Result<String, SimError> {
        let keyword = args.keyword();
        match keyword.as_str() {
            "ET" => {
                let itype = args.int(1)?;
                self.model.define_element_type(itype, args.get(2))?;
                Ok(format!("ELEMENT TYPE {} IS {}", itype, args.upper(2)))
            }
            "KEYOPT" => {
                let knum = usize::try_from(args.int(2)?)
                    .map_err(|_| SimError::invalid("key option number"))?;
                self.model.set_keyopt(args.int(1)?, knum, args.int_or(3, 0)?)?;
                Ok(String::new())
            }
            "TYPE" => {
                self.model.set_type(args.int_or(1, 1)?);
                Ok(String::new())
            }
            "MAT" => {
                self.model.set_material(args.int_or(1, 1)?);
                Ok(String::new())
            }
            "REAL" => {
                self.model.set_real(args.int_or(1, 1)?);
                Ok(String::new())
            }
            "SECNUM" => {
                self.model.set_section(args.int_or(1, 1)?);
                Ok(String::new())
            }
            "ESYS" => {
                self.model.set_esys(args.int_or(1, 0)?);
                Ok(String::new())
            }
            "N" => {
                let num = match args.get(1) {
                    "" => None,
                    _ => Some(args.int(1)?),
                };
                let xyz = [
                    args.number_or(2, 0.0)?,
                    args.number_or(3, 0.0)?,
                    args.number_or(4, 0.0)?,
                ];
                let num = self.model.add_node(num, xyz)?;
                Ok(format!("NODE {}", num))
            }
            "E" => {
                let nodes = (1..args.len())
                    .filter(|&i| !args.get(i).is_empty())
                    .map(|i| args.int(i))
                    .collect::<Result<Vec<_>, _>>()?;
                let num = self.model.add_element(nodes)?;
                Ok(format!("ELEMENT {}", num))
            }
            "NSEL" => {
                let mode = SelectMode::parse(args.get(1))?;
                let item = args.upper(2);
                if !matches!(item.as_str(), "" | "NODE") {
                    return Err(SimError::Unsupported(format!("NSEL by {}", item)));
                }
                let n = self.model.select_nodes(mode, self.range(args, 4)?)?;
                Ok(format!("{} NODES SELECTED", n))
            }
            "ESEL" => {
                let mode = SelectMode::parse(args.get(1))?;
                let n = self
                    .model
                    .select_elements(mode, args.get(2), self.range(args, 4)?)?;
                Ok(format!("{} ELEMENTS SELECTED", n))
            }
            "NSLE" => {
                let n = self
                    .model
                    .select_nodes_of_elements(SelectMode::parse(args.get(1))?);
                Ok(format!("{} NODES SELECTED", n))
            }
            "CM" => {
                let name = args.name(1)?;
                self.model.create_component(&name, Entity::parse(args.get(2))?);
                Ok(format!("COMPONENT {} CREATED", name))
            }
            "CMSEL" => {
                let mode = SelectMode::parse(args.get(1))?;
                let entity = match args.get(3) {
                    "" => None,
                    e => Some(Entity::parse(e)?),
                };
                self.model.select_component(mode, args.get(2), entity)?;
                Ok(String::new())
            }
            "CMDELE" => {
                self.model.delete_component(&args.name(1)?)?;
                Ok(String::new())
            }
            _ => Err(SimError::invalid(format!("unknown command {}", keyword))),
        }
    }

    /// `vmin,vmax` starting at field `i`. `vmax` defaults to `vmin`.
    fn range(&self, args: &Args, i: usize) -> Result<Option<(i32, i32)>, SimError> {
        match args.get(i) {
            "" => Ok(None),
            _ => {
                let lo = args.int(i)?;
                Ok(Some((lo, args.int_or(i + 1, lo)?)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------

    pub fn data_info(&self, name: &str) -> Result<DataInfo, SimError> {
        let name = name.trim().to_ascii_uppercase();
        Ok(self.workspace.get(&name)?.info(&name))
    }

    /// Contents of a vector, or one CSR part of a sparse matrix addressed
    /// as `NAME::ROWS`, `NAME::COLS` or `NAME::VALS` (indices 1-based).
    pub fn vec_data(&self, name: &str) -> Result<Array, SimError> {
        let name = name.trim().to_ascii_uppercase();
        if let Some((matrix, part)) = name.split_once("::") {
            let m = match self.workspace.get(matrix)? {
                Object::Sparse(m) => m,
                _ => return Err(SimError::invalid(format!("{} is not a sparse matrix", matrix))),
            };
            return match part {
                "ROWS" => Ok(m.rows_one_based()),
                "COLS" => Ok(m.cols_one_based()),
                "VALS" => Ok(m.values.clone()),
                other => Err(SimError::NotFound(format!("{}::{}", matrix, other))),
            };
        }
        Ok(self.workspace.vector(&name)?.clone())
    }

    /// Column-major contents of a dense matrix.
    pub fn mat_data(&self, name: &str) -> Result<Array, SimError> {
        let name = name.trim().to_ascii_uppercase();
        match self.workspace.get(&name)? {
            Object::Dense(m) => Ok(m.data.clone()),
            Object::Sparse(m) => {
                let values = m.to_dense(&name)?;
                typed(m.values.value_type(), &values)
            }
            other => Err(SimError::invalid(format!(
                "{} is a {:?}, not a matrix",
                name,
                other.kind()
            ))),
        }
    }

    /// Stores an uploaded array under `name`, creating or replacing it.
    pub fn set_data(&mut self, name: &str, data: Array, shape: Shape) -> Result<Shape, SimError> {
        let name = name.trim().to_ascii_uppercase();
        if name.is_empty() {
            return Err(SimError::InvalidRequest("upload without a target name".to_string()));
        }
        if shape.element_count() != data.len() as u64 {
            return Err(SimError::ShapeMismatch(format!(
                "declared {} values, received {}",
                shape.element_count(),
                data.len()
            )));
        }
        let object = match shape {
            Shape::Vector { .. } => Object::Vector(data),
            Shape::Matrix { rows, cols } => Object::Dense(DenseMat {
                rows: rows as usize,
                cols: cols as usize,
                data,
            }),
        };
        self.workspace.insert(name, object);
        Ok(shape)
    }

    /// `*VGET` over the selected nodes or elements.
    pub fn vget(&self, params: &VgetParams) -> Result<Array, SimError> {
        let entity = Entity::parse(&params.entity)?;
        let item = params.item1.trim().to_ascii_uppercase();
        let values: Vec<f64> = match (entity, item.as_str()) {
            (Entity::Node, "NLIST") => self.model.selected_nodes().map(f64::from).collect(),
            (Entity::Elem, "ELIST") => self.model.selected_elements().map(f64::from).collect(),
            (Entity::Node, "LOC") => {
                let axis = match params.it1num.trim().to_ascii_uppercase().as_str() {
                    "X" => 0,
                    "Y" => 1,
                    "Z" => 2,
                    other => return Err(SimError::invalid(format!("unknown axis {}", other))),
                };
                self.model
                    .selected_nodes()
                    .filter_map(|n| self.model.node_location(n))
                    .map(|xyz| xyz[axis])
                    .collect()
            }
            _ => {
                return Err(SimError::Unsupported(format!(
                    "*VGET {:?} {}",
                    entity, item
                )))
            }
        };
        if values.is_empty() {
            return Ok(Array::Float64(vec![0.0]));
        }
        Ok(Array::Float64(values))
    }

    pub fn nodes(&self) -> Array {
        Array::Float64(self.model.coordinates())
    }

    pub fn elements(&self) -> Array {
        Array::Int32(self.model.element_blob())
    }

    pub fn element_types(&self) -> Array {
        Array::Int32(self.model.element_type_table())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub fn put_file(&mut self, filename: &str, data: Bytes) -> Result<u64, SimError> {
        let filename = filename.trim();
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return Err(SimError::InvalidRequest(format!(
                "bad file name '{}'",
                filename
            )));
        }
        let len = data.len() as u64;
        self.files.insert(filename.to_string(), data);
        Ok(len)
    }

    pub fn file(&self, filename: &str) -> Result<Bytes, SimError> {
        self.files
            .get(filename.trim())
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("file {}", filename)))
    }

    pub fn list_files(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}
