//! Event Wall
//!
//! Photo store and live synchronization service for event photo walls. Guests
//! upload photos, every connected display shows the same newest-first set,
//! and the host can remove photos. The wall holds at most a configured number
//! of photos and evicts the oldest beyond that.
//!
//! ## Features
//!
//! - **Validated Ingest**: type and size checks before anything is stored,
//!   blob-then-record persistence with compensation on failure
//! - **Bounded Retention**: oldest photos evicted after each upload
//! - **Interchangeable Backends**: PostgreSQL + S3, a local JSON document with
//!   inlined images, or process memory
//! - **Live Change Feed**: native push (LISTEN/NOTIFY) with reconnects and a
//!   polling fallback, deduplicated and ordered
//! - **Display Sync**: client-side ordered views kept current from events with
//!   periodic full resyncs, in-process or over HTTP
//!
//! ## Architecture
//!
//! ```text
//!   Guests                 Host
//!     │ upload               │ delete / clear
//!     ▼                      ▼
//! ┌──────────────┐     ┌──────────────┐
//! │ Ingest       │     │ Moderator    │
//! │ Gateway      │     └──────────────┘
//! └──────────────┘            │
//!     │       │               │
//!     │       ▼               │
//!     │ ┌──────────────┐      │
//!     │ │ Retention    │      │
//!     │ │ Manager      │      │
//!     │ └──────────────┘      │
//!     ▼       ▼               ▼
//! ┌────────────────────────────────┐      ┌──────────────┐
//! │ Backend                        │─────▶│ Change Feed  │◀── push / poll
//! │  RecordStore  +  BlobStore     │      └──────────────┘
//! └────────────────────────────────┘             │ SSE / on_change
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │ View         │
//!                                         │ Synchronizer │
//!                                         └──────────────┘
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod feed;
pub mod ingest;
pub mod moderation;
pub mod photo;
pub mod retention;
pub mod store;
pub mod sync;
pub mod wall;

pub use api::{AppState, PhotoResponse};
pub use client::{ClientError, WallClient};
pub use config::Config;
pub use feed::{ChangeEvent, ChangeFeed, SubscriptionHandle};
pub use ingest::{IngestError, IngestGateway, PhotoUpload};
pub use moderation::{DeleteOutcome, ModerationError, Moderator};
pub use photo::{BlobRef, ContentType, PhotoId, PhotoRecord};
pub use retention::RetentionManager;
pub use store::{Backend, BlobStore, LocalStore, MemoryStore, RecordStore, StoreError};
pub use sync::{PhotoSource, PhotoView, ViewChange, ViewSynchronizer};
pub use wall::{PhotoWall, WallOptions};
