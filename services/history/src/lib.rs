//! History Service
//!
//! Multi-tenant time-series history for IoT device telemetry. The persister
//! consumes device lifecycle, device data, notification and tenancy events
//! from Kafka and stores one MongoDB collection per tenant and device. The
//! query API serves that history back as JSON or CSV.
//!
//! ## Features
//!
//! - **Per-tenant supervision**: one listener per (tenant, subject), new
//!   tenants picked up from the tenancy topic at runtime
//! - **Tolerant ingestion**: malformed events are dropped and logged,
//!   timestamps accepted as epoch seconds, epoch milliseconds or ISO-8601
//! - **Idempotent partitions**: indexes ensured on every lifecycle event,
//!   unique `(attr, ts)` on device partitions, a TTL on `ts`
//! - **History API**: device history, notification history, the legacy
//!   STH view and runtime log level control
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topics                                       MongoDB
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────────┐
//! │ tenancy      │────▶│ Supervisor   │     │ device_history       │
//! └──────────────┘     └──────────────┘     │   {tenant}_{device}  │
//!                             │ spawns      │   {tenant}_notifi... │
//! ┌──────────────┐            ▼             └──────────────────────┘
//! │ dojot.device-│     ┌──────────────┐            ▲        │
//! │ manager.dev. │────▶│ Listeners    │            │        │
//! │ device-data  │     └──────────────┘            │        ▼
//! │ notifications│            │             ┌──────────────┐
//! └──────────────┘            ▼             │ History API  │
//!                      ┌──────────────┐     └──────────────┘
//!                      │ Persister    │──────────┘
//!                      │ + Indexes    │
//!                      └──────────────┘
//! ```

pub mod api;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod index_manager;
pub mod logging;
pub mod mongo_store;
pub mod partition;
pub mod persister;
pub mod query;
pub mod response;
pub mod store;
pub mod supervisor;
pub mod timestamp;

pub use api::{create_router, start_api_server, AppState};
pub use clients::{AuthClient, DataBrokerClient, DeviceManagerClient};
pub use config::Config;
pub use consumer::{Bus, KafkaBus, MessageHandler};
pub use error::{HistoryError, Result};
pub use index_manager::IndexManager;
pub use logging::{init_tracing, LogControl, LogLevel};
pub use mongo_store::MongoStore;
pub use partition::PartitionKey;
pub use persister::{Outcome, Persister};
pub use store::HistoryStore;
pub use supervisor::{Supervisor, SupervisorSettings};
