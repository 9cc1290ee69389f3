//! Platform-agnostic filesystem change events.
//!
//! Raw `notify` events are turned into [`FsEvent`]s with [`normalize`], then fed to a
//! [`Debouncer`] which collapses everything a single save operation produces for one
//! path into one logical event.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod debounce;
mod event;

pub use debounce::{Debouncer, DEFAULT_DEBOUNCE_WINDOW, DEFAULT_RECENT_CREATION_WINDOW};
pub use event::{normalize, FsEvent, FsEventKind};
