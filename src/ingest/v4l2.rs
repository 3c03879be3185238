//! V4L2 capture for cameras addressed by device index (`0` is `/dev/video0`).

use image::RgbImage;
use ouroboros::self_referencing;

use super::{CaptureBackend, CaptureError};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

pub(crate) struct V4l2Source {
    device: String,
    state: Option<DeviceState>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            device: format!("/dev/video{}", index),
            state: None,
            active_width: WIDTH,
            active_height: HEIGHT,
        }
    }
}

impl CaptureBackend for V4l2Source {
    fn open(&mut self) -> Result<(), CaptureError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.state = None;
        let device = v4l::Device::with_path(&self.device)
            .map_err(|e| CaptureError::Device(format!("open {}: {}", self.device, e)))?;
        let mut format = device
            .format()
            .map_err(|e| CaptureError::Device(format!("read v4l2 format: {}", e)))?;
        format.width = WIDTH;
        format.height = HEIGHT;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", self.device, err);
                device
                    .format()
                    .map_err(|e| CaptureError::Device(format!("read v4l2 format: {}", e)))?
            }
        };
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(CaptureError::Device(format!(
                "{} does not deliver RGB3 frames (got {})",
                self.device, format.fourcc
            )));
        }
        self.active_width = format.width;
        self.active_height = format.height;

        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|e| CaptureError::Device(format!("create v4l2 buffer stream: {}", e)))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{})",
            self.device,
            self.active_width,
            self.active_height
        );
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::Device("v4l2 device not connected".to_string()))?;
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|e| CaptureError::Device(format!("capture v4l2 frame: {}", e)))?;

        RgbImage::from_raw(self.active_width, self.active_height, pixels)
            .ok_or_else(|| CaptureError::Decode("v4l2 buffer does not match frame size".to_string()))
    }

    fn close(&mut self) {
        self.state = None;
    }
}
