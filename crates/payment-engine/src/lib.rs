//! Outgoing payment engine
//!
//! Drives user payment intents across a streaming micro-payment network:
//! quote, approve (or auto-approve), fund, send, and report, durably and
//! idempotently, with bounded retries across process crashes.
//!
//! The engine owns one aggregate (the outgoing payment row) and two entry
//! points: the [`service::PaymentService`] command surface called by ingress
//! glue, and the [`worker::PaymentWorker`] pool that claims eligible rows
//! under `FOR UPDATE SKIP LOCKED` locks and runs the [`lifecycle`]
//! transitions. External capabilities (accounting, rates, streaming, account
//! service, plugins) are reached only through the [`adapters`] contracts.

pub mod adapters;
pub mod error;
pub mod intent;
pub mod lifecycle;
pub mod payment;
pub mod service;
pub mod state;
pub mod store;
pub mod worker;

// Re-export the engine surface
pub use adapters::Deps;
pub use error::{CommandError, CreateError, ErrorClass, LifecycleError, StreamError};
pub use intent::Intent;
pub use payment::{Payment, PaymentPatch, PaymentType, Quote};
pub use service::{CreateRequest, PaymentService};
pub use state::PaymentState;
pub use store::{Direction, Pagination, PaymentPage, PaymentStore};
pub use worker::{spawn_workers, PaymentWorker};
