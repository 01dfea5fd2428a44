//! Dual-fisheye 360 video to panorama conversion.
//!
//! Each decoded frame is split into its two lens hemispheres, undistorted
//! through a cached remap table, and reassembled side by side with an optional
//! right-angle rotation. [`pipeline::VideoPipeline`] drives one video,
//! [`batch::BatchOrchestrator`] a queue of them, and [`worker`] runs either on
//! a background thread.

pub mod batch;
pub mod calibration;
pub mod defish;
pub mod error;
pub mod image_ops;
pub mod job;
pub mod media;
pub mod mux;
pub mod pipeline;
pub mod progress;
pub mod util;
pub mod worker;

#[cfg(test)]
mod testing;
