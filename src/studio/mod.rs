//! Studio control-plane façade
//!
//! Maps the studio's domain operations onto transport requests:
//!
//! - **client**: async, typed operations over any `Transport`
//! - **blocking**: the synchronous `ControlPlane` contract and its bridge
//! - **testing**: a recording fake of `ControlPlane`

pub mod blocking;
pub mod client;
pub mod testing;

pub use blocking::{BlockingStudioClient, ControlPlane};
pub use client::{ClientError, StudioClient, methods};
pub use testing::RecordingControlPlane;
