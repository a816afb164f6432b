#![deny(missing_docs)]
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-layer escape-time fractal evaluator
//!
//! An escape-time fractal iterates a complex function and asks how the
//! orbit of each point behaves: does it run away, settle down, brush
//! past some trap shape on the plane?  Most renderers answer one of
//! those questions per pixel.  This crate answers several at once: a
//! point is evaluated under a stack of [`ProcessLayer`]s, each with its
//! own bailout, iteration cap, orbit statistic, and measurement, all
//! sharing a single orbit.  One designated default layer decides when
//! the whole point is finished.
//!
//! Alongside the plain interpreted evaluator there are engines that
//! specialize the layer stack into per-layer programs, fan points out
//! over a thread pool, generate a compute kernel for whatever adapter
//! the host offers, or ship batches to remote workers over TCP.  All
//! of them speak the same [`Calculator`] contract and produce the same
//! answers (the kernel engine to within `f32` rounding), so a renderer
//! picks an [`Engine`] and never cares which machinery runs beneath
//! it.

extern crate bytemuck;
extern crate crossbeam;
extern crate failure;
extern crate num;
extern crate pollster;
extern crate tracing;
extern crate wgpu;

pub mod calc;
pub mod compiled;
pub mod formula;
pub mod kernel;
pub mod layer;
pub mod naive;
pub mod plane;
pub mod remote;
pub mod server;
pub mod threaded;
pub mod wire;

pub use calc::{
    CalcError, CalcResult, Calculator, CalculatorFactory, Engine, FractalKind, PointJob,
    PointResult,
};
pub use layer::{ConvCheck, OrbitTrap, ProcessLayer, SeqCheck, SeqType};
pub use plane::PlaneMap;
pub use server::serve;
