pub mod devices;
pub mod generations;
