pub mod logging;
pub mod protocol;
pub mod service;
pub mod supervisor;
pub mod transport;
