//! HTTP API Module
//!
//! Read-only status API over a running node, plus one admin action that
//! forces the leader to relinquish.

mod http;

pub use http::{
    ErrorResponse, HealthResponse, HttpServer, MembersResponse, RelinquishResponse, StatusResponse,
};
