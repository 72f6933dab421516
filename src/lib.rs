// Encrypted credential vault
pub mod vault;

// Identity client and token lifecycle
pub mod auth;

// HTTP API and session store
pub mod api;

// Configuration loading and startup checks
pub mod config;
