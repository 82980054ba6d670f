pub mod abort;
pub mod byte_controller;
pub mod byte_source_trait;
pub mod chunked_queue;
pub mod error;
pub mod pipe;
pub mod readable;
pub mod reader;
pub mod signal;
pub mod tee;
pub mod transform;
pub mod writable;

// Re-export main types
pub use abort::*;
pub use byte_controller::{ByteView, ReadableByteStreamController, ReadableStreamBYOBRequest};
pub use byte_source_trait::*;
pub use chunked_queue::ChunkedQueue;
pub use error::*;
pub use pipe::*;
pub use readable::{
    AsyncStreamSource, IteratorSource, ReadableSource, ReadableStream, ReadableStreamAsyncIterator,
    ReadableStreamBuilder, ReadableStreamDefaultController, ReadableStreamIteratorOptions,
    StreamState,
};
pub use reader::*;
pub use signal::{Signal, SignalFuture};
pub use tee::*;
pub use transform::*;
pub use writable::*;

/// Type-level marker for unlocked streams
pub struct Unlocked;
/// Type-level marker for locked streams
pub struct Locked;

/// Type-level marker for streams fed through a default controller
pub struct DefaultStream;
/// Type-level marker for streams fed through a byte controller
pub struct ByteStream;

pub trait StreamTypeMarker: 'static {}
impl StreamTypeMarker for DefaultStream {}
impl StreamTypeMarker for ByteStream {}

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk
    fn size(&self, chunk: &T) -> usize;

    /// Fallible sizing. A failure errors the stream the chunk was offered to.
    fn try_size(&self, chunk: &T) -> StreamResult<usize> {
        Ok(self.size(chunk))
    }

    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> usize {
        1
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<&'static [u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&'static [u8]) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// `high_water_mark - queued`, saturating instead of wrapping for huge marks.
pub(crate) fn desired_size(high_water_mark: usize, queued: usize) -> isize {
    let hwm = isize::try_from(high_water_mark).unwrap_or(isize::MAX);
    let queued = isize::try_from(queued).unwrap_or(isize::MAX);
    hwm.saturating_sub(queued)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_length_strategy_sizes_by_len() {
        let strategy = ByteLengthQueuingStrategy::new(16);
        assert_eq!(QueuingStrategy::<Vec<u8>>::size(&strategy, &vec![0; 5]), 5);
        assert_eq!(strategy.size(&String::from("abc")), 3);
        assert_eq!(QueuingStrategy::<Vec<u8>>::high_water_mark(&strategy), 16);
    }

    #[test]
    fn desired_size_saturates() {
        assert_eq!(desired_size(4, 1), 3);
        assert_eq!(desired_size(1, 4), -3);
        assert_eq!(desired_size(usize::MAX, 0), isize::MAX);
    }
}
