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

//! Step orchestration for anisotropic pair potentials on accelerators.
//!
//! The crate decides, step by step, which particles are evaluated on an
//! accelerator and which are left to the host, maintains the neighbor list
//! and launches ellipsoid-ellipsoid, ellipsoid-sphere and sphere-sphere
//! kernels. Devices plug in through the traits in [`backend`].

pub mod backend;
pub mod balance;
pub mod config;
mod error;
pub mod form;
pub mod kernels;
pub mod orchestrator;
pub mod ordering;
pub mod timing;

pub use error::{EngineError, Result};
pub use form::{Form, FormMatrix};
pub use orchestrator::{
    BaseEllipsoid, DeviceListStep, DeviceNeighbors, HostListStep, InitParams, NeighborState,
    StepOutcome,
};

extern crate pretty_env_logger;
#[macro_use]
extern crate log;

pub type Vector3 = nalgebra::Vector3<f64>;
pub type UnitQuaternion = nalgebra::UnitQuaternion<f64>;
