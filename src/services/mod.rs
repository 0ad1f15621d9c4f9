// src/services/mod.rs
pub mod assets;
pub mod cost_ledger;
pub mod sessions;
