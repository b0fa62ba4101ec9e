//! SFU Audio Gateway Worker Library
//!
//! This library provides the core functionality of one audio gateway
//! worker - the signaling and session-orchestration process responsible
//! for:
//!
//! - Per-session signaling state machines (start/stop/pause, ICE relay)
//! - Lazy binding of viewer sessions to not-yet-published audio sources
//! - Negotiation against the external media control service
//! - Publishing client events and recording notifications to Redis
//! - Keeping the broker subscription alive under network instability
//!
//! # Architecture
//!
//! One worker runs one [`router::SessionRouter`] fed by a pattern-scoped
//! Redis subscription:
//!
//! ```text
//! BrokerClient (subscriber)
//! └── SessionRouter (session table + pending ICE queues)
//!     └── MediaSession (one per connection+stream+role)
//!         ├── ICE forwarder task (ordered candidate relay)
//!         └── event pump task (flow watchdog, recording, client events)
//! ```
//!
//! Sessions call the media control service through the [`media::MediaControl`]
//! trait and register publisher handles in the shared [`media::SourceRegistry`]
//! so viewers can bind even when they start before their publisher.
//!
//! # Modules
//!
//! - [`broker`] - Redis publish/subscribe with explicit reconnect policy
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing error codes
//! - [`media`] - Media control client, source registry, session machines
//! - [`messages`] - Wire types for control messages and client events
//! - [`router`] - Control message dispatch

pub mod broker;
pub mod config;
pub mod errors;
pub mod media;
pub mod messages;
pub mod router;
