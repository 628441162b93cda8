//! Farview Streamer Library
//!
//! Client-side media pipeline for remote desktop streaming: elementary
//! H.264/H.265/AV1 video and Opus audio in, pixels and PCM out.

pub mod config;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod render;
pub mod utils;

pub use config::Settings;
pub use error::PipelineError;
