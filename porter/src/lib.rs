//! Porter: a server-integrated asset pipeline for browser applications.
//!
//! Given a project root, Porter walks a `require`/`import` dependency graph
//! (`module`, `packet`), transpiles and caches each file it finds (`cache`,
//! `transpile`), and assembles deterministic, content-hashed bundles on
//! request (`bundle`). A debounced filesystem watch (`watcher`) keeps that
//! graph honest as files change. `app::App` is the single entry point that
//! owns all of it and realizes the asset-serving contract as a plain
//! function rather than binding to any particular HTTP framework.

pub mod app;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod matcher;
pub mod module;
pub mod packet;
pub mod resolver;
pub mod transpile;
pub mod watcher;

pub use app::{App, AssetResponse, ReadOptions};
pub use config::Config;
pub use error::{PorterError, Result};
pub use module::{Module, ModuleRef, PacketRef};
pub use packet::Packet;
