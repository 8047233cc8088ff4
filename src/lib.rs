//! shelf - Offline content library
//!
//! Imports packaged content archives into a local library, exports selected
//! contents back into a portable archive, and keeps every content record's
//! on-disk state, reference count and visibility consistent with what is
//! already stored.
//!
//! # Architecture
//!
//! Import and export are linear pipelines of stages:
//! - Each stage takes the operation's context and returns an updated one
//! - The first failing stage ends the operation with a typed error
//! - Record changes for one import commit in a single transaction
//!
//! # Modules
//!
//! - `adapters`: File system and archive services
//! - `core`: Pipelines, materializer and orchestrator
//! - `domain`: Records, manifests, contexts and events
//! - `store`: SQLite-backed content record store
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Import an archive
//! shelf import maths-class-1.ecar
//!
//! # Export a collection with its children
//! shelf export do_31283 --dest /media/usb
//!
//! # Delete a content
//! shelf delete do_31283
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{ExtractionFailurePolicy, LibrarySettings, Orchestrator, StorageLayout};
pub use domain::{
    ContentEvent, ContentEventKind, ContentNode, ContentRecord, ContentState, DeleteRequest,
    DeleteResponse, DeleteStatus, ExportOutcome, ExportRequest, HierarchyInfo, ImportOutcome,
    ImportRequest, Visibility,
};
pub use error::{PipelineError, Stage};
pub use store::{ContentFilter, ContentStore, StoreError};
