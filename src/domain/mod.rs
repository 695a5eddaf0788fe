//! Domain types shared across the crate

pub mod models;
pub mod settings;
