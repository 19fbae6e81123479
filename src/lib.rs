// ===============================
// src/lib.rs
// ===============================
pub mod api;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod pricing;
pub mod recorder;
pub mod risk;
pub mod router;
pub mod service;
pub mod store;
