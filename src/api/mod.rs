//! API Module
//!
//! HTTP handlers and routing for the worker REST API.
//!
//! # Endpoints
//! - `PUT /store` - Store a key-value pair
//! - `PUT /add` - Store only if the key is absent
//! - `GET /fetch/:key` - Retrieve a value by key
//! - `GET /exists/:key` - Check whether a key is live
//! - `DELETE /delete/:key` - Delete a key
//! - `POST /inc/:key`, `POST /dec/:key` - Move an integer counter
//! - `POST /cas/:key` - Compare and swap an integer counter
//! - `POST /clear` - Drop every entry
//! - `GET /stats` - Cache statistics and arena info
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
