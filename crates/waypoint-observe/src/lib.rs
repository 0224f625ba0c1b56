//! Observability setup for Waypoint: structured logging through `tracing`
//! with an optional OpenTelemetry span exporter.

pub mod tracing_setup;
