pub mod live;
pub mod wire;

pub use live::{LiveEvent, LiveHandle, spawn_live_session};
