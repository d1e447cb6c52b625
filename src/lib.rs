//! # `blinkhash`
//!
//! A concurrent ordered index: a B-link tree whose leaves are either sorted
//! arrays or hash buckets.
//!
//! Hash leaves give point operations O(1) work inside the leaf and let
//! writers to different buckets of one leaf proceed in parallel. Sorted
//! leaves keep range scans cheap. A hash leaf that keeps getting scanned is
//! rebuilt as sorted leaves on the fly.
//!
//! ## Thread Safety
//!
//! `Tree<K, V>` is `Send + Sync`. Each thread registers once and passes its
//! [`ThreadInfo`] to every call:
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use blinkhash::Tree;
//!
//! let tree: Arc<Tree<u64, u64>> = Arc::new(Tree::new());
//!
//! let handles: Vec<_> = (0..4u64)
//!     .map(|t| {
//!         let tree = Arc::clone(&tree);
//!         thread::spawn(move || {
//!             let ti = tree.thread_info();
//!             for i in 0..1000 {
//!                 tree.insert(t * 1000 + i, i, &ti);
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! let ti = tree.thread_info();
//! assert_eq!(tree.len(), 4000);
//! assert_eq!(tree.range_lookup(1998, 3, &ti), vec![998, 999, 0]);
//! ```
//!
//! ## Design
//!
//! - Readers validate node versions instead of locking and restart from the
//!   root on any mismatch.
//! - Splits link the new node as a right sibling first, so a traversal that
//!   lands on the wrong node just moves right.
//! - Unlinked nodes are freed by epoch-based reclamation.
//!
//! ## Keys and Values
//!
//! Keys and values are single machine words ([`Word`]), so every field an
//! optimistic reader touches is an atomic.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

pub mod config;
pub mod epoch;
pub mod error;
pub mod key;
pub mod nodeversion;

mod internode;
mod leaf;
mod node;
mod ordering;
mod tracing_helpers;
mod tree;

pub use config::{LeafKind, SpinPolicy, TreeConfig};
pub use epoch::{Epoch, EpochGuard, EpochGuardReadonly, ThreadInfo};
pub use error::{ConfigError, InvariantViolation, Restart, Status};
pub use key::{HashFn, IndexKey, IndexValue, Word, default_hash};
pub use tree::{Tree, TreeStats};
