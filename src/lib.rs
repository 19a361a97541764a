pub mod clock;
pub mod config;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod locks;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduler;
pub mod service;
pub mod tenant;
pub mod uplink;
pub mod wal;
