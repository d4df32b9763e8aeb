//! Kernel Channel - local kernel process lifecycle and raw message channels
//!
//! This crate owns local kernel processes and the line-oriented channel used
//! to exchange protocol frames with them. It knows nothing about the frames'
//! contents; translating them is the bridge's job.
//!
//! # Example
//!
//! ```no_run
//! use kernel_channel::{KernelManager, KernelOutput, KernelSpec};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = KernelManager::new();
//!
//!     let spec = KernelSpec {
//!         command: "python3".to_string(),
//!         args: vec!["-m".to_string(), "my_stdio_kernel".to_string()],
//!         working_dir: None,
//!         env: vec![],
//!     };
//!
//!     let id = manager.spawn(spec).await.unwrap();
//!     let handle = manager.handle(&id).await.unwrap();
//!
//!     let mut rx = handle.subscribe();
//!     handle.send_frame(r#"{"header":{"msg_id":"1"}}"#).await.unwrap();
//!
//!     while let Ok(output) = rx.recv().await {
//!         match output {
//!             KernelOutput::Frame { data, .. } => println!("{}: {}", id, data),
//!             KernelOutput::Exited { .. } => break,
//!         }
//!     }
//! }
//! ```

mod error;
mod manager;
pub mod process;

pub use error::KernelError;
pub use manager::{KernelEvent, KernelId, KernelManager, KernelSummary};
pub use process::{KernelHandle, KernelOutput, KernelPeer, KernelSpec, KernelState};
