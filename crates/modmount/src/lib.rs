//! Overlay mount composer.
//!
//! Given a set of modules, each contributing a filesystem subtree under a
//! well-known root, this crate synthesizes a layered view in which module
//! files appear to overlay the read-only system partitions (`/system`,
//! `/vendor`, ...) at runtime, without modifying the underlying partitions.
//! The composition is planned on a virtual node tree and materialized with
//! an ordered sequence of bind, move, and remount operations that preserves
//! file attributes and SELinux labels.  A complementary teardown path
//! detaches every mount the composer installed.

pub mod attr;
pub mod config;
pub mod modules;
pub mod mount;
pub mod mountinfo;
pub mod tree;
pub mod unmount;

pub use config::Config;
