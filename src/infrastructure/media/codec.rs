use std::path::Path;
use std::sync::Arc;

use crate::common::cancel::CancelSignal;

use super::error::MediaResult;
use super::ffmpeg::FfmpegCodec;
use super::frame::{Frame, StreamInfo};
use super::y4m::{Y4mCodec, is_y4m};

/// Sequential frame source opened on an input artifact.
pub trait FrameReader: Send {
    fn info(&self) -> &StreamInfo;
    fn next_frame(&mut self) -> MediaResult<Option<Frame>>;
}

/// Sequential frame sink writing a destination artifact.
pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()>;

    /// Flushes and closes the container. Dropping a writer without calling this
    /// abandons the output.
    fn finish(self: Box<Self>) -> MediaResult<()>;
}

/// Container decode/encode boundary. Calls block; callers run them on blocking threads.
pub trait MediaCodec: Send + Sync {
    fn probe(&self, path: &Path) -> MediaResult<StreamInfo>;

    fn open_reader(&self, path: &Path, cancel: &CancelSignal) -> MediaResult<Box<dyn FrameReader>>;

    fn open_writer(
        &self,
        path: &Path,
        info: &StreamInfo,
        cancel: &CancelSignal,
    ) -> MediaResult<Box<dyn FrameWriter>>;
}

/// Routes `.y4m` artifacts to the native codec and everything else through ffmpeg.
pub struct ContainerCodec {
    y4m: Y4mCodec,
    ffmpeg: FfmpegCodec,
}

impl ContainerCodec {
    pub fn new(ffmpeg: FfmpegCodec) -> Self {
        Self { y4m: Y4mCodec, ffmpeg }
    }

    fn route(&self, path: &Path) -> &dyn MediaCodec {
        if is_y4m(path) { &self.y4m } else { &self.ffmpeg }
    }

    pub fn shared(self) -> Arc<dyn MediaCodec> {
        Arc::new(self)
    }
}

impl MediaCodec for ContainerCodec {
    fn probe(&self, path: &Path) -> MediaResult<StreamInfo> {
        self.route(path).probe(path)
    }

    fn open_reader(&self, path: &Path, cancel: &CancelSignal) -> MediaResult<Box<dyn FrameReader>> {
        self.route(path).open_reader(path, cancel)
    }

    fn open_writer(
        &self,
        path: &Path,
        info: &StreamInfo,
        cancel: &CancelSignal,
    ) -> MediaResult<Box<dyn FrameWriter>> {
        self.route(path).open_writer(path, info, cancel)
    }
}
