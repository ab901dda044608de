//! Shared most-recent-frame image.
//!
//! The protocol session decodes rectangles into its own back buffer and only
//! publishes a finished frame here, so readers never observe a partially
//! applied update. Published frames are immutable; taking a sample is an
//! `Arc` clone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Bytes per pixel in the negotiated layout (B, G, R, X).
pub const BYTES_PER_PIXEL: usize = 4;

/// Immutable point-in-time copy of the canvas.
#[derive(Debug, Clone)]
pub struct FrameSample {
    width: u16,
    height: u16,
    pixels: Arc<[u8]>,
}

impl FrameSample {
    pub fn new(width: u16, height: u16, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(pixels.len(), frame_len(width, height));
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// All-black frame of the given size.
    pub fn blank(width: u16, height: u16) -> Self {
        Self::new(width, height, vec![0; frame_len(width, height)])
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Size in bytes of one frame.
pub fn frame_len(width: u16, height: u16) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

#[derive(Debug)]
pub struct Canvas {
    width: u16,
    height: u16,
    current: RwLock<FrameSample>,
    generation: AtomicU64,
}

impl Canvas {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            current: RwLock::new(FrameSample::blank(width, height)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Replaces the visible frame with a copy of `pixels`.
    ///
    /// The copy is made before the lock is taken; the lock only guards the
    /// pointer swap.
    pub fn publish(&self, pixels: &[u8]) {
        if pixels.len() != frame_len(self.width, self.height) {
            tracing::error!(
                target: "rfb",
                "[CANVAS] Refusing frame of {} bytes for {}x{} canvas",
                pixels.len(),
                self.width,
                self.height
            );
            return;
        }

        let frame = FrameSample::new(self.width, self.height, pixels.to_vec());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = frame;
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Returns the most recently published frame.
    pub fn snapshot(&self) -> FrameSample {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of frames published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
