//! Domain model module declarations.

pub mod manifest;
pub mod stage;
pub mod validation;
