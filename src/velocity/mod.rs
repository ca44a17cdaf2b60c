//! Velocity computation.
//!
//! Turns a batch of telemetry datagrams plus the arc catalog into per-arc velocity
//! samples: trips are reconstructed, consecutive samples matched to arcs, and each
//! accepted pair contributes one velocity sample to its arc.

pub mod computer;
pub mod utility;

pub use computer::{ArcSamples, DEFAULT_MAX_VELOCITY_MPS, VelocityComputer, summarize};
