pub mod admin;
pub mod device;
pub mod token;
