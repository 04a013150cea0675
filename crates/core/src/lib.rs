//! `roomstage-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod image;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::ImageId;
pub use image::ImageRecord;
pub use status::ImageStatus;
