//! Shared configuration, error taxonomy, and domain types for the courier
//! notification service.

pub mod config;
pub mod db;
pub mod error;
pub mod types;
