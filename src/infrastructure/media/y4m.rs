//! Native YUV4MPEG2 container support.
//!
//! Only 4:2:0 progressive streams are accepted, which is also what the ffmpeg
//! pipe codec requests with `-pix_fmt yuv420p`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::common::cancel::CancelSignal;

use super::codec::{FrameReader, FrameWriter, MediaCodec};
use super::error::{MediaError, MediaResult};
use super::frame::{Frame, StreamInfo};

const MAGIC: &str = "YUV4MPEG2";
const FRAME_MARKER: &[u8] = b"FRAME";
const DEFAULT_FPS: f64 = 30.0;

pub fn is_y4m(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("y4m"))
}

pub struct Y4mReader<R> {
    inner: R,
    info: StreamInfo,
}

impl<R> Y4mReader<R> {
    pub fn set_frame_count(&mut self, frame_count: Option<u64>) {
        self.info.frame_count = frame_count;
    }
}

impl<R: BufRead> Y4mReader<R> {
    pub fn new(mut inner: R) -> MediaResult<Self> {
        let (info, _) = read_header(&mut inner)?;
        Ok(Self { inner, info })
    }

    fn read_frame(&mut self) -> MediaResult<Option<Frame>> {
        let mut line = Vec::new();
        if self.inner.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if !line.starts_with(FRAME_MARKER) || line.last() != Some(&b'\n') {
            return Err(MediaError::InvalidHeader("expected FRAME marker".to_string()));
        }

        let mut data = vec![0u8; self.info.frame_len()?];
        self.inner.read_exact(&mut data).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => MediaError::TruncatedFrame,
            _ => MediaError::Io(e),
        })?;

        Frame::new(self.info.width, self.info.height, data).map(Some)
    }
}

impl<R: BufRead + Send> FrameReader for Y4mReader<R> {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        self.read_frame()
    }
}

pub struct Y4mWriter<W: Write> {
    inner: W,
    info: StreamInfo,
}

impl<W: Write> Y4mWriter<W> {
    pub fn new(mut inner: W, info: &StreamInfo) -> MediaResult<Self> {
        writeln!(
            inner,
            "{} W{} H{} F{} Ip A1:1 C420jpeg",
            MAGIC,
            info.width,
            info.height,
            format_rate(info.fps)
        )?;
        Ok(Self { inner, info: *info })
    }

    pub fn into_inner(mut self) -> MediaResult<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write + Send> FrameWriter for Y4mWriter<W> {
    fn write_frame(&mut self, frame: &Frame) -> MediaResult<()> {
        if frame.width() != self.info.width || frame.height() != self.info.height {
            return Err(MediaError::FrameSize {
                expected: self.info.frame_len()?,
                actual: frame.data().len(),
            });
        }
        self.inner.write_all(FRAME_MARKER)?;
        self.inner.write_all(b"\n")?;
        self.inner.write_all(frame.data())?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> MediaResult<()> {
        self.into_inner().map(|_| ())
    }
}

/// File-backed `.y4m` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Y4mCodec;

impl MediaCodec for Y4mCodec {
    fn probe(&self, path: &Path) -> MediaResult<StreamInfo> {
        let file = open(path)?;
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let (mut info, header_len) = read_header(&mut reader)?;

        let per_frame = (FRAME_MARKER.len() + 1 + info.frame_len()?) as u64;
        info.frame_count = Some(total.saturating_sub(header_len as u64) / per_frame);
        Ok(info)
    }

    fn open_reader(&self, path: &Path, _cancel: &CancelSignal) -> MediaResult<Box<dyn FrameReader>> {
        let reader = Y4mReader::new(BufReader::new(open(path)?))?;
        Ok(Box::new(reader))
    }

    fn open_writer(
        &self,
        path: &Path,
        info: &StreamInfo,
        _cancel: &CancelSignal,
    ) -> MediaResult<Box<dyn FrameWriter>> {
        let file = File::create(path)?;
        Ok(Box::new(Y4mWriter::new(BufWriter::new(file), info)?))
    }
}

fn open(path: &Path) -> MediaResult<File> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => MediaError::FileNotFound(path.to_path_buf()),
        _ => MediaError::Io(e),
    })
}

fn read_header<R: BufRead>(reader: &mut R) -> MediaResult<(StreamInfo, usize)> {
    let mut line = Vec::new();
    let len = reader.read_until(b'\n', &mut line)?;
    if len == 0 || line.last() != Some(&b'\n') {
        return Err(MediaError::InvalidHeader("missing stream header".to_string()));
    }

    let text = std::str::from_utf8(&line)
        .map_err(|_| MediaError::InvalidHeader("header is not ASCII".to_string()))?
        .trim_end();
    let mut tokens = text.split(' ');
    if tokens.next() != Some(MAGIC) {
        return Err(MediaError::InvalidHeader("bad magic".to_string()));
    }

    let (mut width, mut height, mut fps) = (None, None, DEFAULT_FPS);
    for token in tokens.filter(|t| t.len() > 1 && t.is_char_boundary(1)) {
        let (tag, value) = token.split_at(1);
        match tag {
            "W" => width = value.parse::<u32>().ok(),
            "H" => height = value.parse::<u32>().ok(),
            "F" => fps = parse_rate(value)?,
            "C" if !value.starts_with("420") => {
                return Err(MediaError::UnsupportedFormat(format!("chroma {}", value)));
            }
            "I" if value != "p" && value != "?" => {
                return Err(MediaError::UnsupportedFormat("interlaced video".to_string()));
            }
            _ => {}
        }
    }

    let (Some(width), Some(height)) = (width, height) else {
        return Err(MediaError::InvalidHeader("missing frame size".to_string()));
    };
    let info = StreamInfo {
        fps,
        width,
        height,
        frame_count: None,
    };
    info.frame_len()?;
    Ok((info, len))
}

fn parse_rate(value: &str) -> MediaResult<f64> {
    let invalid = || MediaError::InvalidHeader(format!("frame rate {}", value));
    let (num, den) = value.split_once(':').ok_or_else(invalid)?;
    let num: f64 = num.parse().map_err(|_| invalid())?;
    let den: f64 = den.parse().map_err(|_| invalid())?;
    if num <= 0.0 || den <= 0.0 {
        return Err(invalid());
    }
    Ok(num / den)
}

fn format_rate(fps: f64) -> String {
    if (fps - fps.round()).abs() < 1e-6 {
        format!("{}:1", fps.round() as u64)
    } else {
        format!("{}:1000", (fps * 1000.0).round() as u64)
    }
}
