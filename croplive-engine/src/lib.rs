pub mod cadence;
pub mod engine;
pub mod session;
pub mod traits;

pub use cadence::{FrameCadence, FrameClass};
pub use engine::LiveSessionManager;
pub use session::{SessionEvent, SessionSnapshot};
pub use traits::{AudioSink, CapturePipeline, FrameGrabber, MediaSource};
