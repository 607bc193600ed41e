pub mod config;
pub mod cycler;
pub mod error;
pub mod pipeline;
pub mod storage;
