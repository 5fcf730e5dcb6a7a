// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! Error types for the orchestration core.

use thiserror::Error;

/// Errors surfaced by the orchestrator and its collaborators.
///
/// Only [`EngineError::MultipleFormsWithDeviceNeighbors`] is fatal; everything
/// else aborts the current step or init call and leaves the decision to retry
/// with the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Form-based reordering needs host-visible types, which an
    /// accelerator-built neighbor list does not provide.
    #[error("cannot use ellipsoid potentials with multiple interaction forms and accelerator-built neighbor lists")]
    MultipleFormsWithDeviceNeighbors,

    /// A buffer could not grow to the requested size
    #[error("failed to resize {what} to {requested} (capacity {capacity})")]
    Resize {
        what: &'static str,
        requested: usize,
        capacity: usize,
    },

    /// Kernel program compilation or kernel lookup failed
    #[error("failed to compile program '{program}': {message}")]
    Compile { program: String, message: String },

    /// The device refused initialization
    #[error("device initialization failed: {0}")]
    DeviceInit(String),

    /// A kernel launch was rejected by the device
    #[error("kernel launch '{kernel}' failed: {message}")]
    Launch { kernel: String, message: String },

    /// Compute was requested before `init_base` succeeded
    #[error("orchestrator is not initialized")]
    NotInitialized,

    /// Warm step requested but no usable neighbor list exists
    #[error("no usable neighbor list; a rebuild (ago = 0) is required")]
    NoNeighborList,

    /// Malformed step input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Cross-replica reduction failed
    #[error("replica reduction failed: {0}")]
    Reduction(String),
}

impl EngineError {
    /// True for configuration errors that no retry can fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::MultipleFormsWithDeviceNeighbors)
    }

    /// True for allocation failures where a retry with more capacity may succeed.
    pub fn is_resource(&self) -> bool {
        matches!(self, EngineError::Resize { .. } | EngineError::Compile { .. })
    }

    pub(crate) fn resize(what: &'static str, requested: usize, capacity: usize) -> Self {
        EngineError::Resize {
            what,
            requested,
            capacity,
        }
    }

    pub(crate) fn compile(program: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Compile {
            program: program.into(),
            message: message.into(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, EngineError>;
