//! Video frames and where they come from.

use cgmath::Point2;
use image::{imageops, GrayImage, RgbImage};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the input sequence.
    pub index: usize,
    pub color: RgbImage,
    pub gray: GrayImage,
}

impl Frame {
    pub fn new(index: usize, color: RgbImage) -> Self {
        let gray = imageops::grayscale(&color);
        Frame { index, color, gray }
    }

    pub fn width(&self) -> u32 {
        self.color.width()
    }

    pub fn height(&self) -> u32 {
        self.color.height()
    }

    /// Colour at `p`, clamped to the image bounds.
    pub fn sample_color(&self, p: Point2<f64>) -> [u8; 3] {
        if self.width() == 0 || self.height() == 0 {
            return [0, 0, 0];
        }
        let clamp = |v: f64, size: u32| -> u32 {
            if v.is_finite() {
                v.round().max(0.0).min((size - 1) as f64) as u32
            } else {
                0
            }
        };
        let x = clamp(p.x, self.width());
        let y = clamp(p.y, self.height());
        self.color.get_pixel(x, y).0
    }
}

pub enum FrameStatus {
    Frame(Frame),
    Exhausted,
}

/// Sequential frame acquisition.
pub trait FrameSource {
    fn next_frame(&mut self) -> FrameStatus;
}

/// Replays frames held in memory.
pub struct VecFrameSource {
    frames: VecDeque<Frame>,
}

impl VecFrameSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        VecFrameSource {
            frames: frames.into(),
        }
    }
}

impl FrameSource for VecFrameSource {
    fn next_frame(&mut self) -> FrameStatus {
        match self.frames.pop_front() {
            Some(f) => FrameStatus::Frame(f),
            None => FrameStatus::Exhausted,
        }
    }
}

/// Most recent frames, oldest evicted first.
#[derive(Debug, Clone)]
pub struct FrameStore {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameStore {
    pub fn new(capacity: usize) -> Self {
        FrameStore {
            frames: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Frame with sequence index `index` if it is still stored.
    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.iter().rev().find(|f| f.index == index)
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn frame(index: usize) -> Frame {
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(3, 2, Rgb([10, 20, 30]));
        Frame::new(index, img)
    }

    #[test]
    fn test_store_evicts_oldest() {
        let mut store = FrameStore::new(2);
        store.push(frame(0));
        store.push(frame(1));
        store.push(frame(2));
        assert_eq!(store.len(), 2);
        assert!(store.get(0).is_none());
        assert_eq!(store.latest().map(|f| f.index), Some(2));
    }

    #[test]
    fn test_sample_color_clamps() {
        let f = frame(0);
        assert_eq!(f.sample_color(Point2::new(100.0, 100.0)), [10, 20, 30]);
        assert_eq!(f.sample_color(Point2::new(-5.0, 0.0)), [0, 0, 0]);
        assert_eq!(f.gray.dimensions(), (4, 3));
    }

    #[test]
    fn test_vec_source() {
        let mut source = VecFrameSource::new(vec![frame(0)]);
        assert!(match source.next_frame() {
            FrameStatus::Frame(f) => f.index == 0,
            FrameStatus::Exhausted => false,
        });
        assert!(match source.next_frame() {
            FrameStatus::Exhausted => true,
            _ => false,
        });
    }
}
