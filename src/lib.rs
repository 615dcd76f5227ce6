//! Core of petbot, a pet-shop intake assistant.

pub mod channels;
pub mod config;
pub mod error;
pub mod intake;
pub mod llm;
pub mod store;
