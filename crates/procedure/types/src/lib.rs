//! Procedure Domain Types for the Federation Manager
//!
//! The federation manager runs two long-lived approval procedures:
//! federating a resource provider and onboarding a scientific community.
//! Both are modelled as **procedures**: cyclic graphs of steps joined by
//! role-gated, optionally guarded transitions.
//!
//! # Key Concepts
//!
//! - **ProcedureDefinition**: An immutable template. Steps are stored with
//!   an explicit adjacency map (step id → outgoing transitions) so retry
//!   loops need no special handling.
//! - **Step**: A node of the graph: a task, event, gateway or timer.
//! - **Transition**: A directed edge, optionally guarded, at most one
//!   default per gateway.
//! - **InstanceSnapshot**: A read-only view of one execution bound to a
//!   subject (a provider or a community), with its variables and
//!   append-only history. The mutable record belongs to the engine.
//! - **Signal**: The stimulus that may advance an instance: a human
//!   action or an automated result, addressed to the task it acts on.
//!
//! # Design Principles
//!
//! 1. Definitions are validated once and never mutated afterwards.
//! 2. Instances are only mutated by the engine's transition operation;
//!    this crate exposes no mutators.
//! 3. Timer state lives inside the instance so it is persisted atomically
//!    with the transition that armed it.

#![deny(unsafe_code)]

mod definition;
mod errors;
mod instance;
mod signal;
mod transition;

pub use definition::*;
pub use errors::*;
pub use instance::*;
pub use signal::*;
pub use transition::*;
