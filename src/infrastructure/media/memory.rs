//! In-memory codec used as a test double for the pipeline and the job manager.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::cancel::CancelSignal;

use super::codec::{FrameReader, FrameWriter, MediaCodec};
use super::error::{MediaError, MediaResult};
use super::frame::{Frame, StreamInfo};

#[derive(Clone, Default)]
pub struct MemoryCodec {
    sources: Arc<Mutex<HashMap<PathBuf, (StreamInfo, Vec<Frame>)>>>,
    written: Arc<Mutex<HashMap<PathBuf, Vec<Frame>>>>,
    frame_delay: Option<Duration>,
}

impl MemoryCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps before every decoded frame so tests can cancel mid-stream.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Registers `count` frames at `fps` whose luma steps by 10 per frame.
    pub fn add_source(&self, path: &Path, count: usize, fps: f64) {
        let frames: Vec<Frame> = (0..count).map(|i| Frame::filled(4, 4, (i * 10) as u8)).collect();
        let info = StreamInfo {
            fps,
            width: 4,
            height: 4,
            frame_count: Some(count as u64),
        };
        self.sources.lock().unwrap().insert(path.to_path_buf(), (info, frames));
    }

    pub fn written(&self, path: &Path) -> Option<Vec<Frame>> {
        self.written.lock().unwrap().get(path).cloned()
    }
}

impl MediaCodec for MemoryCodec {
    fn probe(&self, path: &Path) -> MediaResult<StreamInfo> {
        self.sources
            .lock()
            .unwrap()
            .get(path)
            .map(|(info, _)| *info)
            .ok_or_else(|| MediaError::FileNotFound(path.to_path_buf()))
    }

    fn open_reader(&self, path: &Path, _cancel: &CancelSignal) -> MediaResult<Box<dyn FrameReader>> {
        let (info, frames) = self
            .sources
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| MediaError::FileNotFound(path.to_path_buf()))?;
        Ok(Box::new(MemoryReader {
            info,
            frames: frames.into_iter(),
            delay: self.frame_delay,
        }))
    }

    fn open_writer(
        &self,
        path: &Path,
        info: &StreamInfo,
        _cancel: &CancelSignal,
    ) -> MediaResult<Box<dyn FrameWriter>> {
        // touch the destination so artifact cleanup has something to remove
        std::fs::write(path, b"")?;
        Ok(Box::new(MemoryWriter {
            path: path.to_path_buf(),
            info: *info,
            frames: Vec::new(),
            sink: self.written.clone(),
        }))
    }
}

struct MemoryReader {
    info: StreamInfo,
    frames: std::vec::IntoIter<Frame>,
    delay: Option<Duration>,
}

impl FrameReader for MemoryReader {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Ok(self.frames.next())
    }
}

struct MemoryWriter {
    path: PathBuf,
    info: StreamInfo,
    frames: Vec<Frame>,
    sink: Arc<Mutex<HashMap<PathBuf, Vec<Frame>>>>,
}

impl FrameWriter for MemoryWriter {
    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()> {
        if frame.width() != self.info.width || frame.height() != self.info.height {
            return Err(MediaError::FrameSize {
                expected: self.info.frame_len()?,
                actual: frame.data().len(),
            });
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> MediaResult<()> {
        let mut sink = self.sink.lock().unwrap();
        sink.insert(self.path, self.frames);
        Ok(())
    }
}
