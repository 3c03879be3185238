use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};

use super::{CaptureBackend, CaptureError};

const FLOOR: Rgb<u8> = Rgb([30, 30, 30]);
const PERSON: Rgb<u8> = Rgb([250, 250, 250]);
const PERSON_SIZE: u32 = 12;

/// Parameters of a `stub://` source.
///
/// `stub://<name>?width=640&height=480&people=3&frames=100&spots=40:60,200:90`
///
/// - `people`: bright blocks that wander across the frame
/// - `spots`: fixed block positions (top-left corners)
/// - `frames`: end of stream after this many frames (loops on rewind)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub people: u32,
    pub spots: Vec<(u32, u32)>,
    pub frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub".to_string(),
            width: 640,
            height: 480,
            people: 3,
            spots: Vec::new(),
            frames: None,
        }
    }
}

impl SyntheticConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub:// source: {}", raw))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut config = Self {
            name: if name.is_empty() { "stub".to_string() } else { name.to_string() },
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}' in {}", pair, raw))?;
            let number = || -> Result<u64> {
                value
                    .parse()
                    .with_context(|| format!("invalid value for '{}' in {}", key, raw))
            };
            match key {
                "width" => config.width = number()? as u32,
                "height" => config.height = number()? as u32,
                "people" => config.people = number()? as u32,
                "frames" => config.frames = Some(number()?),
                "spots" => config.spots = parse_spots(value).with_context(|| format!("in {}", raw))?,
                other => return Err(anyhow!("unknown stub parameter '{}' in {}", other, raw)),
            }
        }

        if config.width < PERSON_SIZE * 2 || config.height < PERSON_SIZE * 2 {
            return Err(anyhow!(
                "stub frame must be at least {0}x{0}",
                PERSON_SIZE * 2
            ));
        }
        Ok(config)
    }
}

fn parse_spots(value: &str) -> Result<Vec<(u32, u32)>> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|spot| {
            let (x, y) = spot
                .split_once(':')
                .ok_or_else(|| anyhow!("spot '{}' must be x:y", spot))?;
            Ok((x.parse()?, y.parse()?))
        })
        .collect()
}

/// Synthetic camera: a dark floor with bright square "people".
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
        }
    }

    fn render(&self) -> RgbImage {
        let SyntheticConfig { width, height, .. } = self.config;
        let mut image = RgbImage::from_pixel(width, height, FLOOR);
        let span_x = (width - PERSON_SIZE) as u64;
        let span_y = (height - PERSON_SIZE) as u64;

        for (x, y) in &self.config.spots {
            draw_person(&mut image, *x, *y);
        }
        for i in 0..self.config.people as u64 {
            let x = (i * 97 + self.frame_count * 7) % span_x;
            let y = (i * 53 + self.frame_count * 5) % span_y;
            draw_person(&mut image, x as u32, y as u32);
        }
        image
    }
}

fn draw_person(image: &mut RgbImage, x: u32, y: u32) {
    for dy in 0..PERSON_SIZE {
        for dx in 0..PERSON_SIZE {
            let (px, py) = (x + dx, y + dy);
            if px < image.width() && py < image.height() {
                image.put_pixel(px, py, PERSON);
            }
        }
    }
}

impl CaptureBackend for SyntheticSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        log::info!(
            "SyntheticSource: opened {} ({}x{})",
            self.config.name,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Err(CaptureError::EndOfStream);
            }
        }
        let image = self.render();
        self.frame_count += 1;
        Ok(image)
    }

    fn rewind(&mut self) -> Result<(), CaptureError> {
        self.frame_count = 0;
        Ok(())
    }
}
