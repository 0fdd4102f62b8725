//! Procedure Workflow Engine for the Federation Manager
//!
//! The engine drives long-running approval procedures (provider federation,
//! community onboarding) through their steps. It advances instances on
//! signals, enforces role-gated transitions, evaluates gateway guards and
//! fires step timers.
//!
//! # Architecture
//!
//! The [`WorkflowEngine`] composes specialized components:
//!
//! - [`RoleResolver`]: Derives role grants from verified identities
//! - [`AuthorizationGate`]: Decides whether a grant may take a transition
//! - [`DefinitionRegistry`]: Stores every version of every procedure
//! - [`InstanceStore`]: Durable instances with optimistic versioning
//! - [`TimerManager`]: Polls the store for due timers and delivers them
//!
//! # Example
//!
//! ```rust
//! use procedure_engine::*;
//! use procedure_types::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let auth = AuthConfig::default()
//!     .with_trusted_issuer("https://idp.example.org")
//!     .with_role(RoleMapping::new(RoleName::site_admin(), ["site-admins"]));
//! let engine = WorkflowEngine::new(Arc::new(InMemoryInstanceStore::new()), auth);
//! engine.register_builtin_procedures().unwrap();
//!
//! let alice = VerifiedIdentity::new("alice", "https://idp.example.org")
//!     .with_group("site-admins");
//! let id = engine
//!     .start_instance(
//!         catalog::PROVIDER_FEDERATION,
//!         Subject::provider("provider-42"),
//!         &alice,
//!         Variables::new(),
//!     )
//!     .await
//!     .unwrap();
//!
//! let snapshot = engine
//!     .advance(&id, Signal::complete("submit_configuration"), &alice)
//!     .await
//!     .unwrap();
//! assert_eq!(snapshot.current_step, StepId::new("assign_tester"));
//! # });
//! ```

#![deny(unsafe_code)]

pub mod catalog;
pub mod clock;
pub mod config;
pub mod definition_registry;
pub mod engine;
pub mod error;
pub mod gate;
pub mod instance;
pub mod roles;
pub mod store;
pub mod timer_manager;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffConfig, TimerConfig};
pub use definition_registry::DefinitionRegistry;
pub use engine::WorkflowEngine;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use gate::{AuthorizationGate, GateDecision};
pub use instance::Instance;
pub use roles::{AuthConfig, RoleGrant, RoleMapping, RoleResolver, VerifiedIdentity};
pub use store::{DueTimer, InMemoryInstanceStore, InstanceFilter, InstanceStore, StoreError, StoreResult};
#[cfg(feature = "postgres")]
pub use store::PostgresInstanceStore;
pub use timer_manager::{PollReport, TimerManager};
