//! Kernel Bridge - Jupyter transport for local and remote kernels
//!
//! A notebook front end speaks the Jupyter wire protocol over WebSocket plus
//! a handful of REST calls. This crate lets such a front end target kernels
//! that run locally without a Jupyter server: connections to
//! `{kernel_id}.{local_marker}` hosts are multiplexed onto one channel per
//! kernel with session ids rewritten per request, REST bootstrap calls are
//! answered locally, and every other target is relayed unmodified.
//!
//! The pieces, leaves first:
//!
//! - [`buffer_codec`] normalizes binary identity frames
//! - [`session_translator`] addresses kernel output back to the issuing client
//! - [`rest_emulator`] answers `/api/sessions` and `/api/kernels`
//! - [`local_adapter`] binds one kernel channel to its connections
//! - [`multiplexer`] shares adapters between connections, reference counted
//! - [`router`] classifies target URLs
//! - [`remote_relay`] forwards everything else
//! - [`surface`] ties them together for one hosting UI surface

pub mod app;
pub mod buffer_codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod local_adapter;
pub mod metrics;
pub mod multiplexer;
pub mod protocol;
pub mod remote_relay;
pub mod rest_emulator;
pub mod router;
pub mod session_translator;
pub mod surface;

pub use error::{BridgeError, Result};
pub use surface::{BridgeContext, BridgeSurface};
