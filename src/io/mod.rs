//! I/O layer - Generic abstractions for process management and framing
//!
//! This module provides the protocol-agnostic pieces of the transport:
//!
//! - **Command**: command-line splitting and executable resolution
//! - **Framing**: newline-delimited message framing with size ceilings
//! - **Process**: child process lifecycle with stdio integration

pub mod command;
pub mod framing;
pub mod process;

// Re-export main types for convenience
pub use command::{CommandLine, CommandLineError};
pub use framing::{Frame, FrameLimits, LineBuffer, encode_frame};
pub use process::{
    ChildProcessManager, ProcessError, ProcessPipes, ProcessState, StderrMonitor, StopMode,
};
