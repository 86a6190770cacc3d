pub mod config;
pub mod dispatch;
pub mod engine;
pub mod gate;
pub mod interval;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod provider;
pub mod slots;
pub mod wal;
pub mod wire;
