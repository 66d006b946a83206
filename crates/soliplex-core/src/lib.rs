// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Soliplex Core - data model and persistence for the document ingestion engine
//!
//! This crate holds the durable heart of the Soliplex ingester: the relational
//! data model, the persistence abstraction with its SQLite and PostgreSQL
//! backends, and the transactional claim/advance operations the scheduler is
//! built on.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       soliplex-engine                           │
//! │        (worker runtime, dispatcher, handler contract)           │
//! └─────────────────────────────────────────────────────────────────┘
//!           │                                   │
//!           │ Persistence trait                 │ ArtifactStore trait
//!           ▼                                   ▼
//! ┌───────────────────────┐         ┌─────────────────────────────┐
//! │    soliplex-core      │         │     soliplex-artifacts      │
//! │    (This Crate)       │         │   (fs / db / s3 backends)   │
//! │  Claim / Advance      │         └─────────────────────────────┘
//! │  Lifecycle History    │
//! │  Cascading Deletion   │
//! └───────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │  SQLite / PostgreSQL  │
//! │   (Durable Storage)   │
//! └───────────────────────┘
//! ```
//!
//! # Step State Machine
//!
//! ```text
//!                  ┌─────────┐
//!      create ───► │ PENDING │ ◄──────────────┐
//!                  └────┬────┘                │
//!                       │ claim               │ retry < retries
//!                       ▼                     │ (after backoff)
//!                  ┌─────────┐                │
//!                  │ RUNNING │────────────────┤
//!                  └────┬────┘   transient    │
//!            success    │        failure      │
//!          ┌────────────┤                     │
//!          ▼            │ fatal failure or    │
//!   ┌───────────┐       │ retries exhausted   │
//!   │ COMPLETED │       ▼                     │
//!   └───────────┘  ┌────────┐                 │
//!                  │ FAILED │ ────────────────┘ (never)
//!                  └────────┘
//! ```
//!
//! Claims are serialized per step: PostgreSQL uses row locks with
//! `FOR UPDATE SKIP LOCKED`, SQLite uses a conditional
//! `UPDATE .. WHERE status = 'PENDING'` that only one claimer can win. Both
//! backends provide the same observable semantics.
//!
//! # Modules
//!
//! - [`artifact`]: the artifact-store capability interface
//! - [`config`]: engine configuration from environment variables
//! - [`error`]: error taxonomy shared across the workspace
//! - [`migrations`]: embedded schema migrations for both backends
//! - [`model`]: record structs and status/type enums
//! - [`persistence`]: the `Persistence` trait and its two backends

#![deny(missing_docs)]

/// Artifact-store capability interface consumed by the engine and cascades.
pub mod artifact;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error taxonomy for persistence, validation, and engine invariants.
pub mod error;

/// Embedded schema migrations for SQLite and PostgreSQL.
pub mod migrations;

/// Record structs and the status / step-type / event enums.
pub mod model;

/// The `Persistence` trait and its SQLite and PostgreSQL backends.
pub mod persistence;
