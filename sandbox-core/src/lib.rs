//! Sandbox Core
//!
//! Core types shared by every part of the sandboxed script engine.
//!
//! This crate contains:
//! - Domain types: jobs, messages, environment snapshots, serialized errors
//! - Protocol: the line-oriented wire format between host and worker
//! - DTOs: request and response bodies of the HTTP API

pub mod domain;
pub mod dto;
pub mod protocol;
