pub mod build;
pub mod checkout;
pub mod command;
pub mod config;
pub mod error;
pub mod git;
pub mod notify;
pub mod repo;
pub mod report;
pub mod run;
pub mod toolchain;
pub mod types;
pub mod worker;

pub use types::*;
