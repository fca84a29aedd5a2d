//! CareLog - Tamper-evident audit trail and backup/restore pipeline
//! for on-premise clinical record installations

pub mod engine;

pub use engine::installation::Installation;
