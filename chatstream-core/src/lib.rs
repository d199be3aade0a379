pub mod accumulator;
pub mod config;
pub mod error;
pub mod event;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod observer;
pub mod session;
pub mod sse;
pub mod telemetry;
pub mod transport;

pub use error::{ChatStreamError, CoreResult};
pub use event::StreamEvent;
pub use session::{ChatSession, ChatSnapshot, ChatStatus, TurnOutcome};
