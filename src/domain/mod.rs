pub mod assignment;
pub mod error;
pub mod models;
pub mod pairing;
pub mod session;
pub mod settings;
pub mod tracker;
