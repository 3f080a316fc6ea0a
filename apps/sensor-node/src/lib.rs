pub mod alert;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod intercom;
pub mod message;
pub mod observation;
pub mod port;
pub mod processing;
pub mod registry;
pub mod schedule;
pub mod sensor;
