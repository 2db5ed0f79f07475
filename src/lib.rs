pub mod batch;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod download;
pub mod error;
pub mod ftp;
pub mod progress;
pub mod remote;
pub mod resources;
pub mod session;
pub mod storage;
pub mod transport;
pub mod upload;
