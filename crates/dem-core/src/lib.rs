pub mod config;
pub mod domain;
pub mod emissivity;
pub mod numerics;
pub mod pipeline;
pub mod queue;
