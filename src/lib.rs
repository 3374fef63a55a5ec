//! Library exports for authgate, shared between the binary and tests.

pub mod auth;
pub mod config;
pub mod kubeclient;
pub mod routes;
pub mod startup;
pub mod state;
