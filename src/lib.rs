//! Passive traffic observer: TCP reassembly, TLS SNI and DNS extraction,
//! and per-remote-IP aggregation with DNS name correlation.

pub mod config;
pub mod db;
pub mod error;
pub mod layers;
pub mod models;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod process;
pub mod reassembly;
pub mod sniff;

pub use error::{Result, SniffError};
