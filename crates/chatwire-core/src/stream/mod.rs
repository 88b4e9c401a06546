//! Incremental generation streams: frames, sessions, transports and the
//! controller that ties them together.

mod controller;
mod frame;
mod generation;
mod transport;

pub use controller::{CancelHandle, StreamController, StreamError, DEFAULT_IDLE_TIMEOUT};
pub use frame::{Frame, FrameDecoder, FrameError};
pub use generation::{DeltaChannel, Epoch, GenerationSession, GenerationStatus};
pub use transport::{
    Connection, FrameSink, HttpTransport, Inbound, StreamOptions, StreamRequest, ThinkingMode,
    Transport, TransportError, TransportEvent,
};
