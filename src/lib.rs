//! # json-mdq
//!
//! A searchable discovery service over a federated JSON metadata feed of
//! identity and service providers.
//!
//! The feed is loaded into an in-memory [`store::EntityStore`], projected
//! into a full-text [`index::EntityIndex`], and served over HTTP. The feed
//! file is watched; after each burst of writes settles, the store is
//! reloaded and the index reconciled against it, while queries keep reading
//! the previous generation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ ChangeWatch │──▶│    Reload    │──▶│  EntityStore  │
//! │  (notify)   │   │ Coordinator  │   │  + tantivy   │
//! └─────────────┘   └──────┬───────┘   └──────┬───────┘
//!                          │ snapshot         │
//!                          ▼                  ▼
//!                     ┌──────────┐      ┌───────────┐
//!                     │  Query   │◀─────│   HTTP    │
//!                     │ Service  │      │  (axum)   │
//!                     └──────────┘      └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entity records and their indexed projection |
//! | [`store`] | Streaming feed parser and entity store |
//! | [`analysis`] | Tokenizers and filters for the index |
//! | [`index`] | Full-text index capability and its tantivy implementation |
//! | [`sync`] | Rebuild and reconcile passes |
//! | [`reload`] | Generation publishing and reload sequencing |
//! | [`watch`] | Debounced source file watching |
//! | [`query`] | Query construction and response shaping |
//! | [`server`] | Discovery HTTP server |

pub mod analysis;
pub mod config;
pub mod index;
pub mod models;
pub mod query;
pub mod reload;
pub mod server;
pub mod store;
pub mod sync;
pub mod watch;
