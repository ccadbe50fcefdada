//! Observability for the rendezvous hub.
//!
//! Metric labels are bounded:
//! - `actor_type`: 2 values (hub, connection)
//! - `action`: 4 values (started, stopped, overwritten, owner_left)
//! - `reason`: 1 value (backpressure)
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `hub_connections_active` | Gauge | none | Current WebSocket connections |
//! | `hub_rooms_active` | Gauge | none | Current non-empty rooms |
//! | `hub_signals_relayed_total` | Counter | none | Signaling payloads delivered |
//! | `hub_signals_dropped_total` | Counter | none | Signals for absent or saturated targets |
//! | `hub_share_changes_total` | Counter | `action` | Screen-share ownership changes |
//! | `hub_events_dropped_total` | Counter | `reason` | Events lost to full connection mailboxes |
//! | `hub_actor_panics_total` | Counter | `actor_type` | Actor panics (bugs) |

pub mod health;
pub mod metrics;

// Re-exports for convenience
pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_event_dropped, record_share_change,
    record_signal_dropped, record_signal_relayed, set_connections_active, set_rooms_active,
};
