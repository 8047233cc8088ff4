//! Core library logic.
//!
//! This module contains:
//! - Extractor: archive extraction and manifest validation
//! - Materializer: record reconciliation and artifact placement
//! - Import / Export / Delete: the staged operations
//! - Packer: export manifest and archive helpers
//! - Hierarchy: child trees and next/previous navigation
//! - Orchestrator: facade over all operations

pub mod delete;
pub mod event_bus;
pub mod export;
pub mod extractor;
pub mod hierarchy;
pub mod import;
pub mod materializer;
pub mod orchestrator;
pub mod packer;
pub mod settings;

// Re-export commonly used types
pub use event_bus::EventBus;
pub use orchestrator::{Orchestrator, Services};
pub use settings::{ExtractionFailurePolicy, LibrarySettings, StorageLayout};
