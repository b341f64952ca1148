//! Frames handed from a source to a detector.
//!
//! A `Frame` is owned by the worker that pulled it and lives for exactly one
//! detector call. It is deliberately not `Clone`: nothing may keep pixels
//! around after the cycle that produced them.

/// Number of bytes per pixel in frame buffers (packed RGB8).
pub const BYTES_PER_PIXEL: usize = 3;

/// One decoded RGB8 image.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source capture counter, starting at 1.
    pub sequence: u64,
}

// No Clone, no AsRef<[u8]>: a frame is consumed by one detector call and dropped.

impl Frame {
    /// Wrap a packed RGB8 buffer. Called by frame sources.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
        }
    }

    /// Read-only pixel access for detector backends.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Expected buffer length for the frame's dimensions.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(BYTES_PER_PIXEL))
    }

    /// True when the buffer length matches `width * height * 3`.
    pub fn is_well_formed(&self) -> bool {
        self.expected_len() == Some(self.data.len())
    }
}

impl std::fmt::Debug for Frame {
    // Never print pixel content.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}
