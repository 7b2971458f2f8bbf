//! memwatch-core: page-protection-based memory change detection and
//! delivery. Watches caller-supplied byte ranges and emits a structured
//! [`event::ChangeEvent`] whenever any byte inside a region changes.
//!
//! This crate is the language-agnostic core; per-language adapters plug
//! into it through [`core_api::Core`] and the [`resolver::Resolver`] /
//! [`worker::ChangeCallback`] traits. See `memwatch-ffi` for the stable
//! `extern "C"` surface adapters actually link against.

pub mod clock;
pub mod config;
pub mod core_api;
pub mod error;
pub mod event;
pub mod fault;
pub mod hash;
pub mod page_index;
pub mod poll;
pub mod protect;
pub mod registry;
pub mod resolver;
pub mod ring;
pub mod stats;
pub mod throttle;
pub mod worker;

pub use config::CoreConfig;
pub use core_api::Core;
pub use error::{CoreError, InitError, ResolverError, WatchError};
pub use event::{ChangeEvent, Where};
pub use resolver::{Location, Resolver};
pub use stats::StatsSnapshot;
pub use worker::ChangeCallback;

pub use memwatch_common::{AdapterId, RegionId};
