//! Asset Delivery Service
//!
//! Owns the asset/video-variation resolution and visit-deduplication core of
//! the studio content platform. Uploaded files are registered as assets with
//! metadata inferred once at creation; video assets carry transcoded
//! variations; downloads are gated behind the paywall and redirected to
//! signed, time-limited object storage URLs; views and downloads are logged
//! into a deduplicating ledger that a scheduled job folds into durable
//! per-asset counters.
//!
//! ## Architecture
//!
//! ```text
//! HTTP API                     PostgreSQL                S3 Bucket
//! ┌────────────────┐          ┌───────────────┐         ┌──────────────┐
//! │ /download-     │          │ assets        │         │ sources /    │
//! │   source/*     │─────────▶│ videos        │         │ renditions   │
//! │ /api/v1/assets │          │ variations    │         └──────────────┘
//! └────────────────┘          │ asset_visits  │                ▲
//!        │                    └───────────────┘                │
//!        │ record_visit              ▲                         │ presign
//!        ▼                           │ fold + truncate         │
//! ┌────────────────┐          ┌───────────────┐         ┌──────────────┐
//! │ Visit Ledger   │          │ Fold          │         │ Object       │
//! │ (dedup insert) │          │ Scheduler     │         │ Storage      │
//! └────────────────┘          └───────────────┘         └──────────────┘
//! ```

pub mod access_policy;
pub mod api;
pub mod asset_store;
pub mod config;
pub mod error;
pub mod object_storage;
pub mod stats_job;
pub mod visit_ledger;

pub use access_policy::{AccessPolicy, PgAccessPolicy};
pub use api::{AppState, Requester};
pub use asset_store::{Asset, AssetStore, NewAsset, NewVariation, SourceType, Video, VideoVariation};
pub use config::Config;
pub use error::DeliveryError;
pub use object_storage::ObjectStorage;
pub use visit_ledger::{VisitIdentity, VisitKind, VisitLedger};
