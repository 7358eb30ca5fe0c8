use super::{Handle, MathObject, SCALAR_PARAM};
use crate::error::ClientError;
use femwire_protocol::Array;

/// A workspace vector.
#[derive(Debug, Clone)]
pub struct Vector {
    handle: Handle,
}

impl Vector {
    pub(crate) fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// Number of elements.
    pub fn size(&self) -> Result<u64, ClientError> {
        let session = self.handle.session()?;
        let dim = session.scalar_param(&format!("{}_DIM", self.handle.name))?;
        Ok(dim as u64)
    }

    /// Element `index` (0-based) as a real number.
    pub fn get(&self, index: usize) -> Result<f64, ClientError> {
        self.handle.scalar(&format!(
            "{}={}({})",
            SCALAR_PARAM,
            self.handle.name,
            index + 1
        ))
    }

    /// Downloads the contents.
    pub fn download(&self) -> Result<Array, ClientError> {
        self.handle.session()?.vec_data(&self.handle.name, None)
    }

    /// Overwrites the contents with `data`.
    pub fn upload(&self, data: &Array) -> Result<(), ClientError> {
        self.handle.session()?.set_vec(&self.handle.name, data)
    }

    /// Inner product with `other`.
    pub fn dot(&self, other: &Vector) -> Result<f64, ClientError> {
        self.handle.check_same_shape(&other.handle)?;
        self.handle.scalar(&format!(
            "*DOT,{},{},{}",
            self.handle.name,
            other.handle.name,
            SCALAR_PARAM
        ))
    }

    /// Element-wise product as a new vector.
    pub fn hadamard(&self, other: &Vector) -> Result<Vector, ClientError> {
        let size = self.size()?;
        let other_size = other.size()?;
        if size != other_size {
            return Err(ClientError::ShapeMismatch(format!(
                "vectors have sizes {} and {}",
                size, other_size
            )));
        }

        let name = self.handle.fresh_name()?;
        self.handle.run(&format!(
            "*VEC,{},{},ALLOC,{}",
            name,
            self.handle.type_char()?,
            size
        ))?;
        self.handle.run(&format!(
            "*HPROD,{},{},{}",
            self.handle.name, other.handle.name, name
        ))?;
        Ok(Vector::from_handle(Handle::new(
            name,
            self.handle.value_type,
            self.handle.weak(),
        )))
    }
}

impl MathObject for Vector {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn copy(&self) -> Result<Self, ClientError> {
        Ok(Vector::from_handle(self.handle.copy("*VEC", false)?))
    }
}
