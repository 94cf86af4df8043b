pub mod bus;
pub mod config;
pub mod derive;
pub mod dispatch;
pub mod logging;
pub mod lookup;
pub mod metrics;
pub mod rounding;
pub mod supervisor;
pub mod wire;
pub mod worker;
