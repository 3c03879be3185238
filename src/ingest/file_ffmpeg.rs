//! Local video file source using FFmpeg.

use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::PathBuf;

use super::{CaptureBackend, CaptureError};

struct Decoding {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

pub(crate) struct FfmpegFileSource {
    path: PathBuf,
    state: Option<Decoding>,
    frame_count: u64,
}

fn device_err(context: &str, err: ffmpeg::Error) -> CaptureError {
    CaptureError::Device(format!("{}: {}", context, err))
}

impl FfmpegFileSource {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: None,
            frame_count: 0,
        }
    }
}

impl CaptureBackend for FfmpegFileSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        ffmpeg::init().map_err(|e| device_err("initialize ffmpeg", e))?;
        let input = ffmpeg::format::input(&self.path)
            .map_err(|e| device_err(&format!("open {}", self.path.display()), e))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| CaptureError::Device("file has no video track".to_string()))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| device_err("load video decoder parameters", e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| device_err("open ffmpeg video decoder", e))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| device_err("create ffmpeg scaler", e))?;

        log::info!(
            "FfmpegFileSource: opened {} ({}x{})",
            self.path.display(),
            decoder.width(),
            decoder.height()
        );
        self.state = Some(Decoding {
            input,
            stream_index,
            decoder,
            scaler,
        });
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Device("file not open".to_string()))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in state.input.packets() {
            if stream.index() != state.stream_index {
                continue;
            }
            state
                .decoder
                .send_packet(&packet)
                .map_err(|e| CaptureError::Decode(format!("send packet: {}", e)))?;

            if state.decoder.receive_frame(&mut decoded).is_ok() {
                state
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .map_err(|e| CaptureError::Decode(format!("scale frame to RGB: {}", e)))?;
                self.frame_count += 1;
                return frame_to_image(&rgb_frame);
            }
        }
        Err(CaptureError::EndOfStream)
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Device("file not open".to_string()))?;
        state
            .input
            .seek(0, ..)
            .map_err(|e| device_err("seek to start", e))?;
        state.decoder.flush();
        log::debug!(
            "FfmpegFileSource: looped {} after {} frames",
            self.path.display(),
            self.frame_count
        );
        Ok(())
    }

    fn close(&mut self) {
        self.state = None;
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage, CaptureError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let slice = data
            .get(start..start + row_bytes)
            .ok_or_else(|| CaptureError::Decode("ffmpeg frame row is out of bounds".to_string()))?;
        pixels.extend_from_slice(slice);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| CaptureError::Decode("RGB buffer size mismatch".to_string()))
}
