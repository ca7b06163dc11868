// Copyright (c) 2024 Botho Foundation

//! BIP151 encryption and BIP150 identity authentication.

pub mod auth;
pub mod connection;
pub mod session;

pub use auth::{HandshakeState, HandshakeStateMachine, Role};
pub use connection::ConnectionState;
pub use session::{CipherSuite, Direction, Session};
