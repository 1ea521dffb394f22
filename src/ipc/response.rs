use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, NackReason, Result};
use crate::ipc::state::{ApplicationState, STATUS_RECORD_LEN};

/// Destination of a reply payload, bounded by the requester's capacity.
pub struct ResponseArea {
    buf: BytesMut,
    capacity: usize,
}

impl ResponseArea {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn reserve(&mut self, len: usize) -> Result<()> {
        let total = self.buf.len() + len;
        if total > self.capacity {
            return Err(Error::InvalidRequest(NackReason::PayloadTooLarge {
                len: total,
                capacity: self.capacity,
            }));
        }
        self.buf.reserve(len);
        Ok(())
    }

    /// Write the first `count` samples of an image.
    ///
    /// Nothing is written if the image does not fit.
    pub fn send_image(&mut self, pixels: &[u8], count: usize) -> Result<()> {
        if count > pixels.len() {
            return Err(Error::Geometry {
                expected: count,
                actual: pixels.len(),
            });
        }
        self.reserve(count)?;
        self.buf.put_slice(&pixels[..count]);
        Ok(())
    }

    pub fn send_status(&mut self, state: &ApplicationState) -> Result<()> {
        self.reserve(STATUS_RECORD_LEN)?;
        state.encode(&mut self.buf);
        Ok(())
    }

    pub fn send_i32(&mut self, value: i32) -> Result<()> {
        self.reserve(4)?;
        self.buf.put_i32_le(value);
        Ok(())
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
