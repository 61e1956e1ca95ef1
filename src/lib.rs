//! A client library for the Jupyter kernel and session protocol: wire
//! codec, socket management, request/reply correlation, comms, and the
//! session/manager layers built on top of a Jupyter server's REST and
//! WebSocket surfaces.
//!
//! The entry points are [`engine::KernelChannelEngine`] for talking
//! directly to one running kernel, [`session::Session`] for the
//! `{path, name, type, kernel}` tuple Jupyter calls a session, and
//! [`manager::KernelManager`]/[`manager::SessionManager`]/
//! [`manager::KernelSpecManager`] for polling a server's running kernels,
//! sessions, and kernelspecs.

#![deny(unsafe_code)]

pub mod comm;
pub mod config;
pub mod engine;
pub mod error;
pub mod future;
pub mod kernelspec;
pub mod manager;
pub mod protocol;
pub mod rest;
pub mod session;
pub mod socket;

pub use comm::{Comm, CommRegistry};
pub use config::ClientConfig;
pub use engine::{ExecuteHandle, KernelChannelEngine, KernelStatus};
pub use error::Error;
pub use future::{FutureRegistry, KernelFuture};
pub use manager::{KernelManager, KernelSpecManager, SessionManager};
pub use rest::{JupyterRestClient, KernelModel, SessionModel};
pub use session::Session;
pub use socket::{SocketFactory, TungsteniteFactory};
