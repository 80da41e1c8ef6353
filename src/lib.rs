//! Routewatch - route health monitoring for a reverse proxy
//!
//! This library keeps the authoritative set of proxy routes and continuously
//! supervises their backends:
//! - Probes each target over DNS, TCP, optional TLS and HTTP/1.1
//! - Classifies failures (DNS, connect, timeout, 5xx, exception, misconfiguration)
//! - Debounces results into a per-route UP / DEGRADED / DOWN state
//! - Schedules probes at per-route intervals with bounded concurrency
//! - Serves consistent snapshots and route management over a REST API

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod prober;
pub mod registry;
pub mod route;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod tls;
