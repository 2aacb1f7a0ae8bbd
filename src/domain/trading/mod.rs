mod types;

pub use types::{
    AccountSnapshot, FillNotice, OrderSide, Position, Signal, SignalAction, SignalIntent,
};
