#![doc = include_str!("../README.md")]

pub mod codec_traits;
pub mod error;
pub mod image_dump;
pub mod signal;
pub mod types;
