//! # Composable Architecture Runtime
//!
//! Runtime implementation for the Composable Architecture.
//!
//! This crate provides the Store runtime that coordinates reducer execution
//! and effect handling.
//!
//! ## Core Components
//!
//! - **Store**: owns the state, serializes actions and runs effects
//! - **Effect Executor**: turns effect descriptions into tasks and feeds their actions back
//! - **Cancellation Registry**: tracks in-flight effects by [`EffectId`](composable_arch_core::EffectId)
//! - **Scoped Stores**: views onto part of a parent store's state and actions
//!
//! ## Example
//!
//! ```
//! use composable_arch_core::{Effect, Effects, Reducer, smallvec};
//! use composable_arch_core::dependencies::DependencyValues;
//! use composable_arch_runtime::Store;
//!
//! #[derive(Debug, Default)]
//! struct Search {
//!     query: String,
//!     results: Vec<String>,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum SearchAction {
//!     QueryChanged(String),
//!     ResultsLoaded(Vec<String>),
//! }
//!
//! struct SearchFeature;
//!
//! impl Reducer for SearchFeature {
//!     type State = Search;
//!     type Action = SearchAction;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut Search,
//!         action: SearchAction,
//!         _dependencies: &DependencyValues,
//!     ) -> Effects<SearchAction> {
//!         match action {
//!             SearchAction::QueryChanged(query) => {
//!                 state.query = query.clone();
//!                 smallvec![Effect::future(async move {
//!                     Some(SearchAction::ResultsLoaded(vec![format!("{query}!")]))
//!                 })]
//!             },
//!             SearchAction::ResultsLoaded(results) => {
//!                 state.results = results;
//!                 Effects::new()
//!             },
//!         }
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::new(Search::default(), SearchFeature);
//! let mut handle = store.send(SearchAction::QueryChanged("rust".into()))?;
//! handle.wait().await;
//! assert_eq!(store.state(|s| s.results.clone()), vec!["rust!".to_string()]);
//! # Ok(())
//! # }
//! ```

mod cancellation;
pub mod config;
pub mod error;
pub mod handle;
pub mod metrics;
mod root;
pub mod store;

pub use config::StoreConfig;
pub use error::StoreError;
pub use handle::EffectHandle;
pub use store::{ActionSubscription, Store};
