//! # Immutable OS lifecycle engine
//!
//! This crate installs, upgrades and resets a Linux appliance whose root
//! filesystem is a sequence of immutable snapshots on a single state
//! partition. Snapshots are created and promoted through a transactional
//! protocol over one of two on-disk layouts: loop-mounted image files or
//! btrfs subvolumes.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

mod backend;
mod bootloader;
pub mod cli;
pub(crate) mod config;
mod error;
mod image;
mod loopdev;
mod mode;
pub(crate) mod mount;
mod runner;
mod selinux;
mod snapshot;
mod snapshotter;
mod sync;
mod transaction;
mod vfs;
