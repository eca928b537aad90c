pub mod config;
pub mod controller;
pub mod error;
pub mod machine;
pub mod remote;
pub mod scheduler;
pub mod shutdown;
pub mod status;
