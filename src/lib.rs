//! # LexHarvest
//!
//! A harvesting and enrichment pipeline for legal documents (official
//! gazette issues and supreme-court decisions) with hybrid search.
//!
//! Documents move through five partially-ordered stages: collected,
//! downloaded, extracted, analyzed, embedded. Each stage's status is
//! persisted per document and reconciled on demand against what actually
//! exists in object storage, so the database never silently drifts from
//! reality. Batches run over explicit id lists with a two-phase
//! force/confirm protocol for redoing finished work.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────┐   ┌──────────┐
//! │ Upstream │──▶│ download > extract > analyze  │──▶│  SQLite  │
//! │ listings │   │          > embed              │   │ + index  │
//! └──────────┘   └──────────────┬────────────────┘   └────┬─────┘
//!                               │                         │
//!                        ┌──────┴──────┐           ┌──────┴─────┐
//!                        │   Object    │           │ CLI + HTTP │
//!                        │   storage   │           │   search   │
//!                        └─────────────┘           └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lexh init                               # create database
//! lexh register https://.../j2024012.pdf  # register source URLs
//! lexh batch download --ids 1,2,3
//! lexh batch extract --ids 1,2,3
//! lexh batch analyze --ids 1,2,3
//! lexh batch embed --ids 1,2,3
//! lexh index rebuild
//! lexh search "customs tariff reform"
//! lexh serve                              # start HTTP API
//! ```

pub mod analysis;
pub mod collect;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod index;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod search;
pub mod server;
pub mod stats;
pub mod status;
pub mod storage;
pub mod validate;
