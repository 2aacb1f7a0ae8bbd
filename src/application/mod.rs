pub mod dispatcher;
pub mod indicators;
pub mod market_data;
pub mod monitor;
pub mod safety;
pub mod supervisor;
pub mod system;
