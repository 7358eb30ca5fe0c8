use super::SCALAR_PARAM;
use crate::error::ClientError;
use crate::session::{Session, WeakSession};
use femwire_protocol::message::DataInfo;
use femwire_protocol::ValueType;

/// Reference shared by every proxy: workspace name, element type, session.
#[derive(Debug, Clone)]
pub struct Handle {
    pub(crate) name: String,
    pub(crate) value_type: ValueType,
    session: WeakSession,
}

impl Handle {
    pub(crate) fn new(name: String, value_type: ValueType, session: WeakSession) -> Self {
        Self {
            name,
            value_type,
            session,
        }
    }

    pub(crate) fn session(&self) -> Result<Session, ClientError> {
        self.session.upgrade()
    }

    pub(crate) fn weak(&self) -> WeakSession {
        self.session.clone()
    }

    pub(crate) fn run(&self, command: &str) -> Result<String, ClientError> {
        self.session()?.run(command)
    }

    pub(crate) fn type_char(&self) -> Result<char, ClientError> {
        type_char(self.value_type)
    }

    pub(crate) fn info(&self) -> Result<DataInfo, ClientError> {
        self.session()?.data_info(&self.name)
    }

    /// Fails locally unless `other` has the same element type and dimensions.
    pub(crate) fn check_same_shape(&self, other: &Handle) -> Result<(), ClientError> {
        if self.value_type != other.value_type {
            return Err(ClientError::TypeMismatch {
                left: self.value_type,
                right: other.value_type,
            });
        }
        let (a, b) = (self.info()?, other.info()?);
        if (a.size1, a.size2) != (b.size1, b.size2) {
            return Err(ClientError::ShapeMismatch(format!(
                "{} is {}x{} but {} is {}x{}",
                self.name, a.size1, a.size2, other.name, b.size1, b.size2
            )));
        }
        Ok(())
    }

    /// Allocates a fresh name in the same session.
    pub(crate) fn fresh_name(&self) -> Result<String, ClientError> {
        self.session()?.names().allocate()
    }

    /// `<command>,<new>,<T>,COPY,<self>[,TRANS]`
    pub(crate) fn copy(&self, command: &str, transpose: bool) -> Result<Handle, ClientError> {
        let name = self.fresh_name()?;
        let suffix = if transpose { ",TRANS" } else { "" };
        self.run(&format!(
            "{},{},{},COPY,{}{}",
            command,
            name,
            self.type_char()?,
            self.name,
            suffix
        ))?;
        Ok(Handle::new(name, self.value_type, self.weak()))
    }

    /// Scalar result of a command writing into [`SCALAR_PARAM`].
    pub(crate) fn scalar(&self, command: &str) -> Result<f64, ClientError> {
        let session = self.session()?;
        session.run(command)?;
        session.scalar_param(SCALAR_PARAM)
    }
}

pub(crate) fn type_char(value_type: ValueType) -> Result<char, ClientError> {
    value_type
        .type_char()
        .ok_or(ClientError::UnsupportedType(value_type))
}
