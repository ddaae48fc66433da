#![doc = include_str!("../README.md")]

pub mod scene;
pub mod software;

pub use scene::{Scene, Uniforms};
pub use software::{SoftwareRenderer, SoftwareTarget};
