//! # femwire-sim
//!
//! Reference engine for femwire.
//!
//! This crate provides:
//! - An in-memory workspace of vectors, matrices and linear solvers
//! - A small finite-element model with selections and components
//! - A line-oriented command interpreter over both
//! - A TCP server speaking the femwire wire protocol
//! - An in-process transport for driving the client without sockets

pub mod config;
pub mod error;
pub mod handler;
pub mod interpreter;
pub mod local;
pub mod model;
pub mod server;
pub mod session;
pub mod workspace;

pub use config::{ConfigError, EngineConfig, NetworkConfig, SimConfig};
pub use error::SimError;
pub use handler::{CommandHandler, Outcome, ServerInfo};
pub use interpreter::Engine;
pub use local::{local_session, LocalTransport};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
