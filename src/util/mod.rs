//! Small process-level helpers

pub mod logging;
