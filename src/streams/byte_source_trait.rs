use std::future::Future;

use super::{byte_controller::ReadableByteStreamController, error::StreamResult, StreamError};
use crate::platform::MaybeSend;

/// Producer of bytes for a byte stream.
///
/// A byte source may answer pulls either by enqueuing owned buffers through
/// [`ReadableByteStreamController::enqueue`] or by writing straight into the
/// reader's buffer exposed by [`ReadableByteStreamController::byob_request`].
pub trait ReadableByteSource: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        controller: &mut ReadableByteStreamController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<StreamError>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        async { Ok(()) }
    }
}
