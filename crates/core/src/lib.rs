//! # Agora Core
//!
//! The "Backbone" of the Agora system - the inter-agent message bus that
//! lets independently-developed pipeline roles exchange typed messages,
//! correlate requests with replies, and keep a durable audit trail.
//!
//! ## Architecture
//!
//! - `message` - the immutable message record, its dispatch kinds, and the
//!   subscription topics
//! - `bus/` - publish/subscribe registry, correlation waiters, and the
//!   day-partitioned journal
//! - `endpoint/` - per-participant adapter: handler dispatch and
//!   request/response helpers with deadlines
//! - `config` - runtime settings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agora_core::bus::MessageBus;
//! use agora_core::endpoint::AgentEndpoint;
//! use std::sync::Arc;
//!
//! let bus = Arc::new(MessageBus::in_memory());
//! let dev = AgentEndpoint::attach("Dev", bus.clone())?;
//! let _arch = AgentEndpoint::attach("Arch", bus.clone())?;
//! let answer = dev.ask("Arch", "Which storage engine fits?").await?;
//! ```

pub mod bus;
pub mod config;
pub mod endpoint;
pub mod message;
