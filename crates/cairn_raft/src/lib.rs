//! Raft consensus crate.
//!
//! This crate provides the deterministic per-group Raft engine used by
//! cairn_store. The API surface is intentionally small: higher layers supply
//! a `LogStore`, a `Machine` and a `Transport`, then feed events through
//! `RaftServer::handle` and perform the returned output.

pub mod raft;
