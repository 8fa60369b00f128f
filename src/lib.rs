#![deny(unused_must_use)]

//! A distributed, shared-memory-parallel tree-walk engine: the core of the gather/scatter loop
//! that SPH and gravity solvers run over a domain-decomposed octree, minus the physics itself.
//!
//! A caller brings a [`tree::Tree`], a [`particles::Particles`] store, a [`transport::Transport`]
//! and a [`kernel::TreeWalkKernel`]; [`orchestrator::run_treewalk`] drives one pass over an
//! active set, and [`smoothing::smoothing_length_loop`] wraps that in the outer convergence loop
//! density-style kernels need.

pub mod culler;
pub mod error;
pub mod exchange;
pub mod export;
pub mod geometry;
pub mod kernel;
pub mod orchestrator;
pub mod particles;
pub mod phases;
pub mod queue;
pub mod scheduling;
pub mod smoothing;
pub mod thread_pool;
pub mod transport;
pub mod tree;
pub mod walker;

pub use nalgebra;
