pub mod codec;
pub mod engine;
pub mod error;
pub mod ffmpeg;
pub mod frame;
#[cfg(test)]
pub mod memory;
pub mod y4m;

pub use codec::{ContainerCodec, FrameReader, FrameWriter, MediaCodec};
pub use engine::{FrameInterpolator, InterpolatorFactory};
pub use error::{MediaError, MediaResult};
pub use frame::{Frame, StreamInfo};
