//! capsulefs: a hierarchical filesystem inside a single host file
//!
//! A container file holds a fixed header, a block allocation table (one
//! signed 32-bit entry per block, chained FAT-style), a directory tree, and
//! the data blocks themselves. Files are copied in and out of the container
//! whole; every file carries a SHA-256 digest computed while it streams in,
//! so silent corruption of data blocks is detectable on the way out.
//!
//! The entry point is [`Session`]: [`Session::create`] builds a fresh
//! container, [`Session::mount`] loads and validates an existing one, and the
//! operations on a mounted session (`copy_in`, `copy_out`, `mkdir`, `rename`,
//! `protect`, `verify`, ...) mirror a small shell vocabulary. All metadata
//! mutations are flushed through an atomic temp-file rename, so a crash never
//! leaves a half-written container behind.
//!
//! ```no_run
//! use capsulefs::Session;
//! use std::path::Path;
//!
//! # fn main() -> capsulefs::Result<()> {
//! let mut fs = Session::create(Path::new("box.cfs"), 16 * 1024 * 1024, 4096, false)?;
//! fs.mkdir("/docs")?;
//! fs.copy_in(Path::new("notes.txt"), "/docs")?;
//! let report = fs.verify("/docs/notes.txt")?;
//! assert!(report.matches);
//! fs.unmount()?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod dir;
pub mod error;
pub mod fat;
pub mod header;
pub mod integrity;
pub mod ops;
pub mod session;

pub use dir::{DirTree, Entry, EntryId, EntryKind};
pub use error::{FsError, Result};
pub use fat::{Fat, CHAIN_END};
pub use header::Header;
pub use integrity::{hex_digest, HashAlgorithm};
pub use ops::{human_size, EntryInfo, SpaceInfo, VerifyReport};
pub use session::Session;

/// Crate version, for the shell banner
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
