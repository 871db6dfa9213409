pub mod config;
pub mod core;
pub mod departments;
pub mod evaluations;
pub mod exports;
pub mod sections;
pub mod sis;
