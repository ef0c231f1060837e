//! Nier Detection Service
//!
//! Accepts an uploaded image, runs the external object detector on it, finds
//! the annotated result image the detector leaves on disk, publishes that
//! image to S3 and answers with the detector's output and the image URL.
//! Every temporary file a request creates is removed once it settles.
//!
//! ## Features
//!
//! - **One response per request**: each job answers exactly once, success or
//!   failure, through a single-use responder
//! - **Result discovery**: the detector does not report where it wrote its
//!   output, so the locator scans run directories and fallback locations
//! - **Serialized detector runs**: a semaphore keeps concurrent requests from
//!   claiming each other's result directory, and uploads still owned by a
//!   running job are never taken for a loose result
//! - **Guaranteed cleanup**: uploads and run directories are removed on
//!   every terminal path
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/detection
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Upload       │──▶│ Process      │──▶│ Artifact     │──▶│ Publisher    │──▶ S3
//! │ Store        │   │ Runner       │   │ Locator      │   │              │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!        │                  │                  │                  │
//!        └──────────────────┴───── Job Orchestrator ─────────────┘
//!                                      │
//!                                      ▼
//!                              response, then cleanup
//! ```

pub mod api;
pub mod artifact_locator;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod process_runner;
pub mod publisher;
pub mod upload_store;

pub use api::AppState;
pub use artifact_locator::{ArtifactLocator, LocateError, ResolvedArtifact, TieBreak};
pub use config::Config;
pub use error::{DetectionError, ErrorResponse};
pub use orchestrator::{DetectionResponse, JobOrchestrator, JobState, Responder};
pub use process_runner::{ProcessOutcome, ProcessRunner, RunnerError};
pub use publisher::{PublishError, PublishedReference, Publisher, S3Publisher};
pub use upload_store::{DetectionRequest, PendingUploads, UploadStore};
