use crate::models::error::MeterError;

/// Fixed-capacity circular byte queue bridging the realtime producer and the
/// consumer tick.
///
/// Not synchronized itself: the owner wraps it in `parking_lot::Mutex` and
/// holds the lock only around `write`/`read_into`/`clear`. Storage is
/// allocated once in `new`; writes never allocate.
///
/// Overflow behavior: a write that does not fit overwrites the oldest unread
/// bytes and bumps `overflow_count`. The owner is expected to `clear()` the
/// whole buffer once it sees a non-zero count.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: Vec<u8>,
    write_index: usize,
    read_index: usize,
    fill_count: usize,
    overflow_count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            write_index: 0,
            read_index: 0,
            fill_count: 0,
            overflow_count: 0,
        }
    }

    /// Copy `data` into the buffer.
    ///
    /// If `data` is larger than capacity, only the last `capacity` bytes are kept.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() || self.capacity() == 0 {
            if !data.is_empty() {
                self.overflow_count += 1;
            }
            return;
        }

        let data = if data.len() > self.capacity() {
            self.overflow_count += 1;
            self.fill_count = 0;
            self.read_index = self.write_index;
            &data[data.len() - self.capacity()..]
        } else {
            data
        };

        self.make_room(data.len());

        let first = data.len().min(self.capacity() - self.write_index);
        self.buffer[self.write_index..self.write_index + first].copy_from_slice(&data[..first]);
        self.buffer[..data.len() - first].copy_from_slice(&data[first..]);
        self.advance_write(data.len());
    }

    /// Write `count` zero bytes, standing in for a gap reported by the backend.
    pub fn write_empty(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        if self.capacity() == 0 {
            self.overflow_count += 1;
            return;
        }

        let count = if count > self.capacity() {
            self.overflow_count += 1;
            self.fill_count = 0;
            self.read_index = self.write_index;
            self.capacity()
        } else {
            count
        };
        self.make_room(count);

        let first = count.min(self.capacity() - self.write_index);
        self.buffer[self.write_index..self.write_index + first].fill(0);
        self.buffer[..count - first].fill(0);
        self.advance_write(count);
    }

    /// Remove exactly `out.len()` bytes in FIFO order into `out`.
    ///
    /// Fails without consuming anything if fewer bytes are buffered.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<(), MeterError> {
        let count = out.len();
        if count > self.fill_count {
            return Err(MeterError::Underflow {
                requested: count,
                available: self.fill_count,
            });
        }
        if count == 0 {
            return Ok(());
        }

        let first = count.min(self.capacity() - self.read_index);
        out[..first].copy_from_slice(&self.buffer[self.read_index..self.read_index + first]);
        out[first..].copy_from_slice(&self.buffer[..count - first]);

        self.read_index = (self.read_index + count) % self.capacity();
        self.fill_count -= count;
        Ok(())
    }

    /// Remove and return `count` bytes in FIFO order.
    pub fn read(&mut self, count: usize) -> Result<Vec<u8>, MeterError> {
        let mut out = vec![0; count];
        self.read_into(&mut out)?;
        Ok(out)
    }

    /// Reset cursors, fill count and overflow count.
    pub fn clear(&mut self) {
        self.write_index = 0;
        self.read_index = 0;
        self.fill_count = 0;
        self.overflow_count = 0;
    }

    /// Number of bytes currently available for reading.
    pub fn fill_count(&self) -> usize {
        self.fill_count
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.fill_count
    }

    /// Writes that exceeded free space since the last `clear`.
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    pub fn is_empty(&self) -> bool {
        self.fill_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    // Drop the oldest bytes so `incoming` fits.
    fn make_room(&mut self, incoming: usize) {
        let excess = (self.fill_count + incoming).saturating_sub(self.capacity());
        if excess > 0 {
            self.overflow_count += 1;
            self.read_index = (self.read_index + excess) % self.capacity();
            self.fill_count -= excess;
        }
    }

    fn advance_write(&mut self, count: usize) {
        self.write_index = (self.write_index + count) % self.capacity();
        self.fill_count += count;
    }
}
