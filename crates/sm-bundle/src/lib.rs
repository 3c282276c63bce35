//! Portable context bundles for SecuraMem.
//!
//! A `.smemctx` bundle packages exported memories for transport between
//! machines. It is a directory (or a single ZIP file) containing:
//!
//! - `manifest.json`: schema version, bundle type, counts, vector shape
//! - `map.csv`: one row of chunk metadata per exported code chunk
//! - `vectors.f32`: concatenated little-endian float32 vectors, in
//!   `map.csv` order (may be empty)
//! - `notes.jsonl`: JSON lines of non-code memories
//! - `checksums.json`: SHA-256 of each file above
//! - optional `signature.bin` + `publickey.der`: detached Ed25519
//!   signature over the files in canonical order
//!
//! Code chunk *text* deliberately never leaves the machine: the map and
//! vectors are enough to rebuild the searchable index on the other side.
//!
//! Import verifies checksums first (exit 4), then the signature (exit 3),
//! then ingests. The legacy `.agmctx` layout reads through the same
//! reader. Unknown future schema versions fail closed.

pub mod error;
pub mod manifest;
pub mod reader;
pub mod writer;

pub use error::{BundleError, Result};
pub use manifest::{BundleManifest, BundleType, MapRow, VectorsInfo, BUNDLE_SCHEMA_VERSION, CANONICAL_FILE_ORDER};
pub use reader::{BundleContents, BundleReader, SignatureState};
pub use writer::BundleWriter;
