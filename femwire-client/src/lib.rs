//! # femwire-client
//!
//! Blocking client library for femwire engines.
//!
//! This crate provides:
//! - TCP connection with handshake, timeouts and interrupt deferral
//! - Sessions that serialize round trips and fail fast once terminated
//! - Proxies for vectors, matrices and solvers in the engine workspace
//! - A multi-threaded local cache of the engine's mesh

pub mod config;
pub mod connection;
pub mod error;
pub mod math;
pub mod mesh;
pub mod names;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use math::{
    CsrMatrix, DenseMatrix, EigOptions, FactorizeOptions, FullMatrix, FullVector, Init, MathApi,
    MathObject, Matrix, MatrixKind, NormKind, Solver, SolverAlgo, Vector,
};
pub use mesh::{ElementType, MeshCache, MeshData};
pub use names::NameAllocator;
pub use session::{Session, WeakSession};
pub use transport::{Reply, Transport};
