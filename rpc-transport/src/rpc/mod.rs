// Copyright (c) 2024 Botho Foundation

//! Request/response layer: the connection driver, request correlation and
//! the server side.

pub mod driver;
pub mod multiplexer;
pub mod server;

pub use driver::{ConnectionHandle, ConnectionStatus, KeyVerifier, TransportDriver};
pub use multiplexer::{
    Callback, Completion, Dispatch, RequestHandle, RequestMultiplexer, SubscriptionId,
};
pub use server::{IncomingRequest, ServerConnection};
