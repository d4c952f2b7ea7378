//! # Registry Infrastructure
//!
//! Runtime registries for pluggable components. Currently this is the
//! [`DistributorRegistry`], which the mutation handlers receive through
//! [`HandlerContext`](crate::mutation::HandlerContext) rather than a global.

pub mod distributor_registry;

pub use distributor_registry::DistributorRegistry;
