//! Byte stream controller with zero-copy (BYOB) reads.
//!
//! Chunks are owned `Vec<u8>` buffers. A reader that brings its own buffer
//! hands ownership of it to the controller as a pending pull-into descriptor;
//! the buffer is filled from the queue or by the source and handed back in
//! the read result. While the source holds a buffer through
//! [`ReadableStreamBYOBRequest::take_view`] the descriptor is *detached* and
//! must be answered with [`ReadableStreamBYOBRequest::respond_with_new_view`].

use std::{collections::VecDeque, num::NonZeroUsize};

use futures::{
    channel::{
        mpsc::{self, UnboundedReceiver},
        oneshot,
    },
    StreamExt,
};
use parking_lot::Mutex;
use tracing::trace;

use super::{
    byte_source_trait::ReadableByteSource,
    chunked_queue::ChunkedQueue,
    error::{StreamError, StreamResult},
    readable::{
        PullFlags, ReadIntoRequest, ReadRequest, ReadableController, ReadableStream,
        ReadableStreamBuilder, ReadableStreamInner, SourceCommand, StreamCore, StreamState,
    },
    reader::{ReadableStreamBYOBReadResult, ReadableStreamBYOBReader},
    ByteStream, CountQueuingStrategy, Locked, Unlocked,
};
use crate::platform::{self, PlatformFuture, SharedPtr, WeakPtr};

// ----------- Views -----------
/// A window `[byte_offset, byte_offset + byte_length)` over an owned buffer.
///
/// `element_size` plays the role of a typed array's element width: BYOB reads
/// only complete in whole elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteView {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    element_size: usize,
}

impl From<Vec<u8>> for ByteView {
    fn from(buffer: Vec<u8>) -> Self {
        Self::new(buffer)
    }
}

impl ByteView {
    /// A byte-granular view over the whole buffer.
    pub fn new(buffer: Vec<u8>) -> Self {
        let byte_length = buffer.len();
        Self {
            buffer,
            byte_offset: 0,
            byte_length,
            element_size: 1,
        }
    }

    pub fn with_range(buffer: Vec<u8>, byte_offset: usize, byte_length: usize) -> StreamResult<Self> {
        if byte_offset
            .checked_add(byte_length)
            .map_or(true, |end| end > buffer.len())
        {
            return Err(StreamError::OutOfRange("view exceeds its buffer"));
        }
        Ok(Self {
            buffer,
            byte_offset,
            byte_length,
            element_size: 1,
        })
    }

    /// Reinterprets the view as elements of `element_size` bytes.
    pub fn with_element_size(mut self, element_size: usize) -> StreamResult<Self> {
        if element_size == 0 {
            return Err(StreamError::InvalidArgument("element size must be non-zero"));
        }
        if self.byte_offset % element_size != 0 || self.byte_length % element_size != 0 {
            return Err(StreamError::OutOfRange(
                "view is not aligned to its element size",
            ));
        }
        self.element_size = element_size;
        Ok(self)
    }

    pub(crate) fn from_parts(buffer: Vec<u8>, byte_offset: usize, byte_length: usize, element_size: usize) -> Self {
        Self {
            buffer,
            byte_offset,
            byte_length,
            element_size,
        }
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Number of whole elements in the view.
    pub fn len(&self) -> usize {
        self.byte_length / self.element_size
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    /// Length of the underlying buffer, independent of the window.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// Returns the whole underlying buffer.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// Returns just the viewed bytes, reusing the allocation.
    pub fn into_bytes(self) -> Vec<u8> {
        let Self {
            mut buffer,
            byte_offset,
            byte_length,
            ..
        } = self;
        buffer.truncate(byte_offset + byte_length);
        if byte_offset > 0 {
            buffer.drain(..byte_offset);
        }
        buffer
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, usize, usize, usize) {
        (self.buffer, self.byte_offset, self.byte_length, self.element_size)
    }
}

// ----------- Controller state -----------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderType {
    Default,
    Byob,
    /// The reader that issued the descriptor was released.
    None,
}

#[derive(Debug)]
struct PullIntoDescriptor {
    /// `None` while the source holds the buffer.
    buffer: Option<Vec<u8>>,
    buffer_byte_length: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    reader_type: ReaderType,
}

impl PullIntoDescriptor {
    fn into_filled_view(self) -> ByteView {
        debug_assert!(self.bytes_filled <= self.byte_length);
        let buffer = self.buffer.unwrap_or_default();
        ByteView::from_parts(buffer, self.byte_offset, self.bytes_filled, self.element_size)
    }
}

struct ByteQueueEntry {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
}

/// Copies queued bytes into `desc`, returning `true` once it holds at least
/// `minimum_fill` bytes rounded down to whole elements.
fn fill_pull_into_descriptor_from_queue(
    queue: &mut ChunkedQueue<ByteQueueEntry>,
    queue_total_size: &mut usize,
    desc: &mut PullIntoDescriptor,
) -> bool {
    let Some(dest) = desc.buffer.as_mut() else {
        return false;
    };
    let max_bytes_to_copy = (*queue_total_size).min(desc.byte_length - desc.bytes_filled);
    let max_bytes_filled = desc.bytes_filled + max_bytes_to_copy;
    let max_aligned_bytes = max_bytes_filled - max_bytes_filled % desc.element_size;

    let mut remaining = max_bytes_to_copy;
    let mut ready = false;
    if max_aligned_bytes >= desc.minimum_fill {
        remaining = max_aligned_bytes - desc.bytes_filled;
        ready = true;
    }

    while remaining > 0 {
        let Some(head) = queue.peek_mut() else {
            break;
        };
        let bytes_to_copy = remaining.min(head.byte_length);
        let dest_start = desc.byte_offset + desc.bytes_filled;
        dest[dest_start..dest_start + bytes_to_copy]
            .copy_from_slice(&head.buffer[head.byte_offset..head.byte_offset + bytes_to_copy]);
        if head.byte_length == bytes_to_copy {
            queue.shift();
        } else {
            head.byte_offset += bytes_to_copy;
            head.byte_length -= bytes_to_copy;
        }
        *queue_total_size -= bytes_to_copy;
        desc.bytes_filled += bytes_to_copy;
        remaining -= bytes_to_copy;
    }

    if !ready {
        debug_assert_eq!(*queue_total_size, 0);
        debug_assert!(desc.bytes_filled < desc.minimum_fill);
    }
    ready
}

pub(crate) struct ByteController<T> {
    queue: ChunkedQueue<ByteQueueEntry>,
    queue_total_size: usize,
    high_water_mark: usize,
    auto_allocate_chunk_size: Option<NonZeroUsize>,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    byob_request: Option<u64>,
    next_request_id: u64,
    pub(crate) flags: PullFlags,
    close_requested: bool,
    into_chunk: fn(Vec<u8>) -> T,
}

impl ByteController<Vec<u8>> {
    fn new(high_water_mark: usize, auto_allocate_chunk_size: Option<NonZeroUsize>) -> Self {
        Self {
            queue: ChunkedQueue::new(),
            queue_total_size: 0,
            high_water_mark,
            auto_allocate_chunk_size,
            pending_pull_intos: VecDeque::new(),
            byob_request: None,
            next_request_id: 0,
            flags: PullFlags::default(),
            close_requested: false,
            into_chunk: std::convert::identity,
        }
    }
}

impl<T> ByteController<T> {
    pub(crate) fn desired_size(&self, core: &StreamCore<T>) -> Option<isize> {
        match core.state {
            StreamState::Errored => None,
            StreamState::Closed => Some(0),
            StreamState::Readable => Some(super::desired_size(self.high_water_mark, self.queue_total_size)),
        }
    }

    pub(crate) fn should_call_pull(&self, core: &StreamCore<T>) -> bool {
        if !core.is_readable() || self.close_requested || !self.flags.started {
            return false;
        }
        if core.has_default_reader() && core.num_read_requests() > 0 {
            return true;
        }
        if core.has_byob_reader() && core.num_read_into_requests() > 0 {
            return true;
        }
        self.desired_size(core).is_some_and(|size| size > 0)
    }

    pub(crate) fn call_pull_if_needed(&mut self, core: &mut StreamCore<T>) {
        if self.should_call_pull(core) && self.flags.begin() {
            core.request_pull();
        }
    }

    fn reset_queue(&mut self) {
        self.queue.clear();
        self.queue_total_size = 0;
    }

    fn invalidate_byob_request(&mut self) {
        self.byob_request = None;
    }

    fn clear_pending_pull_intos(&mut self) {
        self.invalidate_byob_request();
        self.pending_pull_intos.clear();
    }

    fn shift_pending_pull_into(&mut self) -> Option<PullIntoDescriptor> {
        debug_assert!(self.byob_request.is_none());
        self.pending_pull_intos.pop_front()
    }

    fn enqueue_chunk_to_queue(&mut self, buffer: Vec<u8>, byte_offset: usize, byte_length: usize) {
        self.queue.push(ByteQueueEntry {
            buffer,
            byte_offset,
            byte_length,
        });
        self.queue_total_size += byte_length;
    }

    fn enqueue_cloned_chunk_to_queue(&mut self, bytes: &[u8]) {
        self.enqueue_chunk_to_queue(bytes.to_vec(), 0, bytes.len());
    }

    /// Moves whatever a released reader's descriptor already received back
    /// into the queue.
    fn enqueue_detached_pull_into_to_queue(&mut self) {
        let filled = match self.pending_pull_intos.front() {
            Some(desc) => {
                debug_assert_eq!(desc.reader_type, ReaderType::None);
                match &desc.buffer {
                    Some(buffer) if desc.bytes_filled > 0 => {
                        Some(buffer[desc.byte_offset..desc.byte_offset + desc.bytes_filled].to_vec())
                    }
                    _ => None,
                }
            }
            None => return,
        };
        if let Some(bytes) = filled {
            self.enqueue_cloned_chunk_to_queue(&bytes);
        }
        self.shift_pending_pull_into();
    }

    fn process_pull_into_descriptors_using_queue(&mut self) -> Vec<PullIntoDescriptor> {
        debug_assert!(!self.close_requested);
        let mut filled = Vec::new();
        while let Some(desc) = self.pending_pull_intos.front_mut() {
            if self.queue_total_size == 0 {
                break;
            }
            if !fill_pull_into_descriptor_from_queue(&mut self.queue, &mut self.queue_total_size, desc) {
                break;
            }
            if let Some(desc) = self.shift_pending_pull_into() {
                filled.push(desc);
            }
        }
        filled
    }

    fn process_read_requests_using_queue(&mut self, core: &mut StreamCore<T>) {
        while core.num_read_requests() > 0 {
            if self.queue_total_size == 0 {
                return;
            }
            let Some(request) = core.take_read_request() else {
                return;
            };
            self.fill_read_request_from_queue(core, request);
        }
    }

    fn fill_read_request_from_queue(&mut self, core: &mut StreamCore<T>, request: ReadRequest<T>) {
        debug_assert!(self.queue_total_size > 0);
        let Some(entry) = self.queue.shift() else {
            return;
        };
        self.queue_total_size -= entry.byte_length;
        self.handle_queue_drain(core);
        let view = ByteView::from_parts(entry.buffer, entry.byte_offset, entry.byte_length, 1);
        let _ = request.send(Ok(Some((self.into_chunk)(view.into_bytes()))));
    }

    fn handle_queue_drain(&mut self, core: &mut StreamCore<T>) {
        debug_assert!(core.is_readable());
        if self.queue_total_size == 0 && self.close_requested {
            core.clear_algorithms();
            core.close();
        } else {
            self.call_pull_if_needed(core);
        }
    }

    fn commit_pull_into_descriptor(&mut self, core: &mut StreamCore<T>, desc: PullIntoDescriptor) {
        debug_assert_ne!(core.state, StreamState::Errored);
        debug_assert_ne!(desc.reader_type, ReaderType::None);
        let done = core.state == StreamState::Closed;
        if done {
            debug_assert_eq!(desc.bytes_filled % desc.element_size, 0);
        }
        let reader_type = desc.reader_type;
        let view = desc.into_filled_view();
        if reader_type == ReaderType::Default {
            let chunk = (!done).then(|| (self.into_chunk)(view.into_bytes()));
            core.fulfill_read_request(chunk);
        } else {
            core.fulfill_read_into_request(view, done);
        }
    }

    fn commit_all(&mut self, core: &mut StreamCore<T>, descriptors: Vec<PullIntoDescriptor>) {
        for desc in descriptors {
            self.commit_pull_into_descriptor(core, desc);
        }
    }

    pub(crate) fn enqueue(&mut self, core: &mut StreamCore<T>, chunk: Vec<u8>) -> StreamResult<()> {
        if self.close_requested {
            return Err(StreamError::InvalidState("cannot enqueue after close was requested"));
        }
        if !core.is_readable() {
            return Err(StreamError::InvalidState("cannot enqueue into a stream that is not readable"));
        }
        if chunk.is_empty() {
            return Err(StreamError::InvalidArgument("chunk must not be empty"));
        }
        let byte_length = chunk.len();

        if let Some(first) = self.pending_pull_intos.front() {
            if first.buffer.is_none() {
                return Err(StreamError::Detached);
            }
        }
        self.invalidate_byob_request();
        if self
            .pending_pull_intos
            .front()
            .is_some_and(|first| first.reader_type == ReaderType::None)
        {
            self.enqueue_detached_pull_into_to_queue();
        }

        if core.has_default_reader() {
            self.process_read_requests_using_queue(core);
            if core.num_read_requests() == 0 {
                debug_assert!(self.pending_pull_intos.is_empty());
                self.enqueue_chunk_to_queue(chunk, 0, byte_length);
            } else {
                debug_assert!(self.queue.is_empty());
                if let Some(first) = self.shift_pending_pull_into() {
                    debug_assert_eq!(first.reader_type, ReaderType::Default);
                }
                core.fulfill_read_request(Some((self.into_chunk)(chunk)));
            }
        } else if core.has_byob_reader() {
            self.enqueue_chunk_to_queue(chunk, 0, byte_length);
            let filled = self.process_pull_into_descriptors_using_queue();
            self.commit_all(core, filled);
        } else {
            self.enqueue_chunk_to_queue(chunk, 0, byte_length);
        }
        self.call_pull_if_needed(core);
        Ok(())
    }

    pub(crate) fn close(&mut self, core: &mut StreamCore<T>) -> StreamResult<()> {
        if self.close_requested {
            return Err(StreamError::InvalidState("close was already requested"));
        }
        if !core.is_readable() {
            return Err(StreamError::InvalidState("cannot close a stream that is not readable"));
        }
        if self.queue_total_size > 0 {
            self.close_requested = true;
            return Ok(());
        }
        if let Some(first) = self.pending_pull_intos.front() {
            if first.bytes_filled % first.element_size != 0 {
                let error = StreamError::InsufficientBytes;
                self.error(core, error.clone());
                return Err(error);
            }
        }
        core.clear_algorithms();
        core.close();
        Ok(())
    }

    pub(crate) fn error(&mut self, core: &mut StreamCore<T>, error: StreamError) {
        if !core.is_readable() {
            return;
        }
        self.clear_pending_pull_intos();
        self.reset_queue();
        core.clear_algorithms();
        core.error(error);
    }

    pub(crate) fn cancel_steps(
        &mut self,
        core: &mut StreamCore<T>,
        reason: Option<StreamError>,
    ) -> oneshot::Receiver<StreamResult<()>> {
        self.clear_pending_pull_intos();
        self.reset_queue();
        core.cancel_source(reason)
    }

    pub(crate) fn pull_steps(&mut self, core: &mut StreamCore<T>, request: ReadRequest<T>) {
        if self.queue_total_size > 0 {
            debug_assert_eq!(core.num_read_requests(), 0);
            self.fill_read_request_from_queue(core, request);
            return;
        }
        if let Some(size) = self.auto_allocate_chunk_size {
            let size = size.get();
            self.pending_pull_intos.push_back(PullIntoDescriptor {
                buffer: Some(vec![0; size]),
                buffer_byte_length: size,
                byte_offset: 0,
                byte_length: size,
                bytes_filled: 0,
                minimum_fill: 1,
                element_size: 1,
                reader_type: ReaderType::Default,
            });
        }
        core.add_read_request(request);
        self.call_pull_if_needed(core);
    }

    pub(crate) fn release_steps(&mut self) {
        if let Some(first) = self.pending_pull_intos.front_mut() {
            first.reader_type = ReaderType::None;
            self.pending_pull_intos.truncate(1);
        }
    }

    pub(crate) fn pull_into(
        &mut self,
        core: &mut StreamCore<T>,
        view: ByteView,
        min: usize,
        request: ReadIntoRequest,
    ) {
        let (buffer, byte_offset, byte_length, element_size) = view.into_parts();
        let minimum_fill = min * element_size;
        debug_assert!(minimum_fill >= element_size && minimum_fill <= byte_length);
        let mut desc = PullIntoDescriptor {
            buffer_byte_length: buffer.len(),
            buffer: Some(buffer),
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill,
            element_size,
            reader_type: ReaderType::Byob,
        };

        if !self.pending_pull_intos.is_empty() {
            self.pending_pull_intos.push_back(desc);
            core.add_read_into_request(request);
            return;
        }

        if core.state == StreamState::Closed {
            let view = ByteView::from_parts(desc.buffer.unwrap_or_default(), byte_offset, 0, element_size);
            let _ = request.send(Ok(ReadableStreamBYOBReadResult {
                value: Some(view),
                done: true,
            }));
            return;
        }

        if self.queue_total_size > 0 {
            if fill_pull_into_descriptor_from_queue(&mut self.queue, &mut self.queue_total_size, &mut desc) {
                let view = desc.into_filled_view();
                self.handle_queue_drain(core);
                let _ = request.send(Ok(ReadableStreamBYOBReadResult {
                    value: Some(view),
                    done: false,
                }));
                return;
            }
            if self.close_requested {
                let error = StreamError::InsufficientBytes;
                self.error(core, error.clone());
                let _ = request.send(Err(error));
                return;
            }
        }

        self.pending_pull_intos.push_back(desc);
        core.add_read_into_request(request);
        self.call_pull_if_needed(core);
    }

    fn respond_in_closed_state(&mut self, core: &mut StreamCore<T>) {
        if self
            .pending_pull_intos
            .front()
            .is_some_and(|first| first.reader_type == ReaderType::None)
        {
            self.shift_pending_pull_into();
        }
        if core.has_byob_reader() {
            while core.num_read_into_requests() > 0 {
                let Some(desc) = self.shift_pending_pull_into() else {
                    break;
                };
                self.commit_pull_into_descriptor(core, desc);
            }
        }
    }

    fn respond_in_readable_state(&mut self, core: &mut StreamCore<T>, bytes_written: usize) {
        let (reader_type, bytes_filled, minimum_fill) = match self.pending_pull_intos.front_mut() {
            Some(first) => {
                debug_assert!(first.bytes_filled + bytes_written <= first.byte_length);
                first.bytes_filled += bytes_written;
                (first.reader_type, first.bytes_filled, first.minimum_fill)
            }
            None => return,
        };

        if reader_type == ReaderType::None {
            self.enqueue_detached_pull_into_to_queue();
            let filled = self.process_pull_into_descriptors_using_queue();
            self.commit_all(core, filled);
            return;
        }
        if bytes_filled < minimum_fill {
            return;
        }

        let Some(mut desc) = self.shift_pending_pull_into() else {
            return;
        };
        let remainder = desc.bytes_filled % desc.element_size;
        if remainder > 0 {
            let end = desc.byte_offset + desc.bytes_filled;
            if let Some(buffer) = &desc.buffer {
                let tail = buffer[end - remainder..end].to_vec();
                self.enqueue_cloned_chunk_to_queue(&tail);
            }
        }
        desc.bytes_filled -= remainder;
        let filled = self.process_pull_into_descriptors_using_queue();
        self.commit_pull_into_descriptor(core, desc);
        self.commit_all(core, filled);
    }

    fn respond_internal(&mut self, core: &mut StreamCore<T>, bytes_written: usize) {
        self.invalidate_byob_request();
        if core.state == StreamState::Closed {
            debug_assert_eq!(bytes_written, 0);
            self.respond_in_closed_state(core);
        } else {
            debug_assert!(core.is_readable());
            debug_assert!(bytes_written > 0);
            self.respond_in_readable_state(core, bytes_written);
        }
        self.call_pull_if_needed(core);
    }

    fn respond(&mut self, core: &mut StreamCore<T>, bytes_written: usize) -> StreamResult<()> {
        let first = self
            .pending_pull_intos
            .front()
            .ok_or(StreamError::InvalidState("no pending read to respond to"))?;
        if first.buffer.is_none() {
            return Err(StreamError::Detached);
        }
        if core.state == StreamState::Closed {
            if bytes_written != 0 {
                return Err(StreamError::InvalidArgument(
                    "bytes written must be 0 once the stream is closed",
                ));
            }
        } else {
            if bytes_written == 0 {
                return Err(StreamError::InvalidArgument(
                    "bytes written must be greater than 0 while the stream is readable",
                ));
            }
            if first.bytes_filled + bytes_written > first.byte_length {
                return Err(StreamError::OutOfRange("bytes written exceeds the view"));
            }
        }
        self.respond_internal(core, bytes_written);
        Ok(())
    }

    fn respond_with_new_view(&mut self, core: &mut StreamCore<T>, view: ByteView) -> StreamResult<()> {
        let closed = core.state == StreamState::Closed;
        let first = self
            .pending_pull_intos
            .front_mut()
            .ok_or(StreamError::InvalidState("no pending read to respond to"))?;
        if let Err(error) = check_new_view(first, &view, closed) {
            // A buffer taken with `take_view` goes back so the request stays answerable.
            if first.buffer.is_none() && view.buffer_len() == first.buffer_byte_length {
                first.buffer = Some(view.into_buffer());
            }
            return Err(error);
        }
        let (buffer, _, byte_length, _) = view.into_parts();
        first.buffer = Some(buffer);
        self.respond_internal(core, byte_length);
        Ok(())
    }

    fn current_byob_request(&mut self) -> Option<u64> {
        if self.byob_request.is_none() && !self.pending_pull_intos.is_empty() {
            self.byob_request = Some(self.next_request_id);
            self.next_request_id += 1;
        }
        self.byob_request
    }

    fn check_request(&self, id: u64) -> StreamResult<&PullIntoDescriptor> {
        if self.byob_request != Some(id) {
            return Err(StreamError::InvalidState("BYOB request is no longer valid"));
        }
        self.pending_pull_intos
            .front()
            .ok_or(StreamError::InvalidState("BYOB request is no longer valid"))
    }
}

fn check_new_view(desc: &PullIntoDescriptor, view: &ByteView, closed: bool) -> StreamResult<()> {
    if closed {
        if !view.is_empty() {
            return Err(StreamError::InvalidArgument(
                "view must be empty once the stream is closed",
            ));
        }
    } else if view.is_empty() {
        return Err(StreamError::InvalidArgument(
            "view must be non-empty while the stream is readable",
        ));
    }
    if desc.byte_offset + desc.bytes_filled != view.byte_offset() {
        return Err(StreamError::OutOfRange("view offset does not match the request"));
    }
    if desc.buffer_byte_length != view.buffer_len() {
        return Err(StreamError::OutOfRange(
            "view buffer length does not match the request",
        ));
    }
    if desc.bytes_filled + view.byte_length() > desc.byte_length {
        return Err(StreamError::OutOfRange("view is larger than the request"));
    }
    Ok(())
}

// ----------- Public controller -----------
/// Handle given to a [`ReadableByteSource`] to feed its byte stream.
#[derive(Clone)]
pub struct ReadableByteStreamController {
    inner: WeakPtr<Mutex<ReadableStreamInner<Vec<u8>>>>,
}

type ByteParts<'a> = (&'a mut ByteController<Vec<u8>>, &'a mut StreamCore<Vec<u8>>);

fn with_byte_parts<R>(
    inner: &WeakPtr<Mutex<ReadableStreamInner<Vec<u8>>>>,
    f: impl FnOnce(ByteParts<'_>) -> R,
) -> StreamResult<R> {
    let inner = inner.upgrade().ok_or(StreamError::TaskDropped)?;
    let mut guard = inner.lock();
    let inner = &mut *guard;
    match &mut inner.controller {
        ReadableController::Byte(controller) => Ok(f((controller, &mut inner.core))),
        ReadableController::Default(_) => Err(StreamError::InvalidState("not a byte stream")),
    }
}

impl ReadableByteStreamController {
    pub(crate) fn new(inner: WeakPtr<Mutex<ReadableStreamInner<Vec<u8>>>>) -> Self {
        Self { inner }
    }

    /// The outstanding BYOB request, if a reader is waiting on a buffer.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        let id = with_byte_parts(&self.inner, |(controller, _)| controller.current_byob_request())
            .ok()
            .flatten()?;
        Some(ReadableStreamBYOBRequest {
            inner: self.inner.clone(),
            id,
        })
    }

    pub fn desired_size(&self) -> Option<isize> {
        with_byte_parts(&self.inner, |(controller, core)| controller.desired_size(core))
            .ok()
            .flatten()
    }

    pub fn enqueue(&self, chunk: Vec<u8>) -> StreamResult<()> {
        with_byte_parts(&self.inner, |(controller, core)| controller.enqueue(core, chunk))?
    }

    pub fn close(&self) -> StreamResult<()> {
        with_byte_parts(&self.inner, |(controller, core)| controller.close(core))?
    }

    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        with_byte_parts(&self.inner, |(controller, core)| controller.error(core, error))
    }

    fn settle(&self, f: impl FnOnce(&mut ReadableStreamInner<Vec<u8>>)) {
        if let Some(inner) = self.inner.upgrade() {
            f(&mut inner.lock());
        }
    }
}

/// A reader's buffer offered to the source for direct filling.
///
/// The request stays valid until it is answered or the controller moves on
/// (an `enqueue`, an error, a cancel).
pub struct ReadableStreamBYOBRequest {
    inner: WeakPtr<Mutex<ReadableStreamInner<Vec<u8>>>>,
    id: u64,
}

impl ReadableStreamBYOBRequest {
    /// Number of bytes still wanted by the request, `None` once invalid.
    pub fn view_len(&self) -> Option<usize> {
        with_byte_parts(&self.inner, |(controller, _)| {
            controller
                .check_request(self.id)
                .ok()
                .map(|desc| desc.byte_length - desc.bytes_filled)
        })
        .ok()
        .flatten()
    }

    /// Runs `f` over the unfilled part of the reader's buffer.
    pub fn with_view<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> StreamResult<R> {
        with_byte_parts(&self.inner, |(controller, _)| {
            controller.check_request(self.id)?;
            let desc = controller
                .pending_pull_intos
                .front_mut()
                .ok_or(StreamError::InvalidState("BYOB request is no longer valid"))?;
            let start = desc.byte_offset + desc.bytes_filled;
            let end = desc.byte_offset + desc.byte_length;
            let buffer = desc.buffer.as_mut().ok_or(StreamError::Detached)?;
            Ok(f(&mut buffer[start..end]))
        })?
    }

    /// Copies as much of `data` as fits and responds with that count.
    pub fn fill(&self, data: &[u8]) -> StreamResult<usize> {
        let written = self.with_view(|view| {
            let n = view.len().min(data.len());
            view[..n].copy_from_slice(&data[..n]);
            n
        })?;
        self.respond(written)?;
        Ok(written)
    }

    /// Reports `bytes_written` bytes written into the view.
    pub fn respond(&self, bytes_written: usize) -> StreamResult<()> {
        with_byte_parts(&self.inner, |(controller, core)| {
            controller.check_request(self.id)?;
            controller.respond(core, bytes_written)
        })?
    }

    /// Takes ownership of the reader's buffer. The request must then be
    /// answered through [`respond_with_new_view`](Self::respond_with_new_view).
    pub fn take_view(&self) -> StreamResult<ByteView> {
        with_byte_parts(&self.inner, |(controller, _)| {
            controller.check_request(self.id)?;
            let desc = controller
                .pending_pull_intos
                .front_mut()
                .ok_or(StreamError::InvalidState("BYOB request is no longer valid"))?;
            let buffer = desc.buffer.take().ok_or(StreamError::Detached)?;
            Ok(ByteView::from_parts(
                buffer,
                desc.byte_offset + desc.bytes_filled,
                desc.byte_length - desc.bytes_filled,
                1,
            ))
        })?
    }

    /// Answers the request with a buffer that replaces the reader's one.
    ///
    /// The view must start where the request's unfilled region starts and
    /// its buffer must have the original buffer's length.
    pub fn respond_with_new_view(&self, view: ByteView) -> StreamResult<()> {
        with_byte_parts(&self.inner, |(controller, core)| {
            controller.check_request(self.id)?;
            controller.respond_with_new_view(core, view)
        })?
    }
}

// ----------- Source task -----------
async fn byte_stream_task<Source: ReadableByteSource>(
    mut source: Source,
    mut controller: ReadableByteStreamController,
    mut commands: UnboundedReceiver<SourceCommand>,
) {
    let started = source.start(&mut controller).await;
    controller.settle(|inner| inner.on_start_settled(started));

    while let Some(command) = commands.next().await {
        match command {
            SourceCommand::Pull => {
                let result = source.pull(&mut controller).await;
                controller.settle(|inner| inner.on_pull_settled(result));
            }
            SourceCommand::Cancel { reason, completion } => {
                let result = source.cancel(reason).await;
                let _ = completion.send(result);
            }
        }
    }
    trace!("byte source task finished");
}

// ----------- Construction -----------
impl ReadableStream<Vec<u8>, ByteStream, Unlocked> {
    /// Returns a builder for a byte stream over `source`.
    pub fn builder_bytes<Source>(source: Source) -> ReadableStreamBuilder<Vec<u8>, Source, ByteStream>
    where
        Source: ReadableByteSource,
    {
        ReadableStreamBuilder::with_parts(source, Box::new(CountQueuingStrategy::new(0)), 0)
    }

    /// Locks the stream to a new BYOB reader.
    pub fn get_byob_reader(
        &self,
    ) -> StreamResult<(ReadableStream<Vec<u8>, ByteStream, Locked>, ReadableStreamBYOBReader)> {
        let reader = ReadableStreamBYOBReader::acquire(self.inner.clone())?;
        Ok((ReadableStream::from_inner(self.inner.clone()), reader))
    }
}

impl<Source: ReadableByteSource> ReadableStreamBuilder<Vec<u8>, Source, ByteStream> {
    /// Bytes to buffer ahead of readers. Defaults to 0.
    pub fn high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Lets default readers trigger BYOB-style pulls into fresh buffers of
    /// `size` bytes.
    pub fn auto_allocate_chunk_size(mut self, size: NonZeroUsize) -> Self {
        self.auto_allocate_chunk_size = Some(size);
        self
    }

    /// Return stream + driver future without spawning
    pub fn prepare(self) -> (ReadableStream<Vec<u8>, ByteStream, Unlocked>, PlatformFuture<'static, ()>) {
        let (tx, rx) = mpsc::unbounded();
        let controller = ReadableController::Byte(ByteController::new(
            self.high_water_mark,
            self.auto_allocate_chunk_size,
        ));
        let inner = SharedPtr::new(Mutex::new(ReadableStreamInner::new(controller, tx)));
        let controller = ReadableByteStreamController::new(SharedPtr::downgrade(&inner));
        let fut = byte_stream_task(self.source, controller, rx);
        (ReadableStream::from_inner(inner), platform::boxed(fut))
    }

    /// Spawn the driver with the given executor entry point
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<Vec<u8>, ByteStream, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(fut);
        stream
    }
}
