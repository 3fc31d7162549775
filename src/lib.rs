pub mod record;
pub mod batch;
pub mod sink;
pub mod shipper;
pub mod source;

pub mod loki;
#[cfg(feature = "kafka")]
pub mod kafka;

pub mod config;
pub mod env;
pub mod init;
pub mod noop_sink;
pub mod service;
