pub mod config;
pub mod credentials;
pub mod device;
pub mod generation;
pub mod lifecycle;
pub mod permissions;
pub mod sandbox;
pub mod terminal;
