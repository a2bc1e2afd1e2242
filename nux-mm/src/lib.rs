//! Physical/virtual memory management engine for the NUX kernel library.
//!
//! Generic over the HAL's [`pagetable::HalPaging`] trait so the page-table
//! engine, the zone allocator, KVA/KMEM arithmetic, the PFN cache and UMAP
//! are all host-testable against a software paging model — exactly like the
//! teacher's `kernel/mm` crate is `cargo test`-able without a kernel target.
#![cfg_attr(not(test), no_std)]

pub mod kmem;
pub mod kva;
pub mod pagetable;
pub mod pfncache;
pub mod pmm;
pub mod umap;
pub mod zone;

pub use pagetable::HalPaging;
