//! dospin - spin droplets up on connect, down when idle
//!
//! Each logical server listens on a set of ports. The first client to
//! connect causes its droplet to be created (or reused), the connection is
//! proxied through, and once no client has been seen for the configured
//! idle period the droplet is powered off, optionally snapshotted, and
//! destroyed.
//!
//! - [`controller`] serializes lifecycle operations per server
//! - [`compute`] creates and destroys droplets idempotently
//! - [`proxy`] relays connections and reports liveness
//! - [`listener`] feeds accepted connections to controllers

pub mod action;
pub mod admin;
pub mod api;
pub mod compute;
pub mod config;
pub mod controller;
pub mod error;
pub mod forward;
pub mod listener;
pub mod locator;
pub mod proxy;
