pub mod health;
pub mod kernels;
pub mod websocket;

pub use health::{health_handler, health_live_handler, metrics_handler};
pub use kernels::{launch_kernel, list_kernels, shutdown_kernel};
pub use websocket::bridge_websocket_handler;
