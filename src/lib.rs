pub mod channel;
pub mod config;
pub mod hex;
pub mod probe;
pub mod reflect;
pub mod session;
