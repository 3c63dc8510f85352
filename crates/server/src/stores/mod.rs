pub mod audit;
pub mod command;
pub mod device;
pub mod policy;
pub mod telemetry;
