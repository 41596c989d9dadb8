mod attachment;
pub mod buffer;
mod error;
mod payload;
mod provider;
mod ratelimiter;

pub use attachment::Attachment;
pub use buffer::{EchoTarget, HandoffBuffer, ParkWakeup, Wakeup};
pub use error::{BindError, BufferError, ChannelError, CodecError};
pub use payload::Payload;
pub use provider::{BufferProvider, BufferProviderConfig, Consumer, Producer, SharedInputGroup};
pub use ratelimiter::RateLimiter;
