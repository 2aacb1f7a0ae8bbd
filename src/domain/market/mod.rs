mod bar;
mod timeframe;

pub use bar::{Bar, OpenBar, Tick};
pub use timeframe::Timeframe;
