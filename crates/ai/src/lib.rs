//! `roomstage-ai`
//!
//! **Responsibility:** AI staging boundary.
//!
//! Turns an uploaded room photo into a staged rendition through a managed
//! inference provider:
//! - reads the source image from object storage
//! - submits a prediction and polls it under a fixed deadline
//! - stores the produced image and returns its location
//!
//! This crate never touches image records; callers own the status lifecycle.

pub mod client;
pub mod error;
pub mod http_store;
pub mod inference;
pub mod job;
pub mod prompt;
pub mod replicate;
pub mod storage;

pub use client::{StagingClient, StagingConfig};
pub use error::StagingError;
pub use http_store::HttpObjectStore;
pub use inference::{InferenceApi, InferenceError, NewPrediction, Prediction, PredictionInput, PredictionStatus};
pub use job::{Stager, StagingRequest};
pub use prompt::{StagingPrompt, build_prompt};
pub use replicate::ReplicateApi;
pub use storage::{InMemoryObjectStore, ObjectStore, StorageError};
