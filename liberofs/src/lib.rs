//! A pure Rust library for reading EROFS (Enhanced Read-Only File System) images.
//!
//! EROFS is a read-only filesystem designed for performance and space efficiency,
//! commonly used in Android and other embedded systems. This crate parses the
//! on-disk format directly: flat, chunk-based and compressed (LZ4/DEFLATE) data
//! layouts, multi-device images, tail-packed and fragment pclusters.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::Read;
//! use memmap2::Mmap;
//! use liberofs::Filesystem;
//!
//! let file = File::open("image.erofs").unwrap();
//! let mmap = unsafe { Mmap::map(&file) }.unwrap();
//! let fs = Filesystem::mount(mmap).unwrap();
//!
//! let mut file = fs.open("/etc/passwd").unwrap();
//! let mut content = String::new();
//! file.read_to_string(&mut content).unwrap();
//! ```

mod decompress;
mod device;
mod dirent;
mod error;
pub mod file;
pub mod filesystem;
mod read;
pub mod types;
pub mod walkdir;
mod zmap;

pub use device::ReadAt;
pub use dirent::{DirEntry, ReadDir};
pub use error::*;
pub use filesystem::{BlockMap, Filesystem, MapFlags};
pub use walkdir::{WalkDir, WalkDirEntry};
