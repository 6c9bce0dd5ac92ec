// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Core types and collaborator contracts for the Plinth replication core.
//!
//! This crate provides the building blocks shared by placement, quorum, and
//! repair:
//! - Node, object, and bucket records
//! - The error taxonomy
//! - Content digests (CRC-32C)
//! - The [`MetadataStore`] and [`NodeTransport`] contracts, each with an
//!   in-memory implementation for tests and single-process use

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checksum;
pub mod error;
pub mod metadata;
pub mod transport;
pub mod types;

pub use checksum::{digest, ChecksumCalculator, Crc32cCalculator, Digest};
pub use error::{Error, Result};
pub use metadata::{MemoryMetadataStore, MetadataStore, NodeLiveness, VersionCursor};
pub use transport::{Fault, MemoryTransport, NodeTransport};
pub use types::{
    storage_key, BucketRecord, Node, NodeResult, NodeStatus, NodeTier, ObjectRecord, ObjectState,
    NULL_VERSION_ID,
};
