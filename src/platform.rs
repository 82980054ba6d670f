//! Platform-specific type aliases and trait bounds
//!
//! The engine is single-threaded cooperative by nature, but its handles can be
//! made `Send + Sync` so drivers may be spawned on a multi-threaded executor.
//!
//! - `send` feature (default): `Arc` based, every driver future is `Send`
//! - `local` feature: `Rc` based, no `Send`/`Sync` requirements

#[cfg(all(feature = "send", feature = "local"))]
compile_error!("features `send` and `local` are mutually exclusive");

#[cfg(not(any(feature = "send", feature = "local")))]
compile_error!("enable exactly one of the `send` or `local` features");

// ============================================================================
// MULTI-THREADED (send feature - default)
// ============================================================================
#[cfg(feature = "send")]
pub use std::sync::{Arc as SharedPtr, Weak as WeakPtr};

#[cfg(feature = "send")]
pub use futures::future::BoxFuture as PlatformFuture;

#[cfg(feature = "send")]
pub trait MaybeSend: Send {}
#[cfg(feature = "send")]
impl<T: Send> MaybeSend for T {}

#[cfg(feature = "send")]
pub trait MaybeSync: Sync {}
#[cfg(feature = "send")]
impl<T: Sync> MaybeSync for T {}

#[cfg(feature = "send")]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + Send + 'static>;

#[cfg(feature = "send")]
pub(crate) type DynWritableTarget = dyn crate::streams::writable::ControllerTarget + Send + Sync;

// ============================================================================
// SINGLE-THREADED (local feature)
// ============================================================================
#[cfg(all(feature = "local", not(feature = "send")))]
pub use std::rc::{Rc as SharedPtr, Weak as WeakPtr};

#[cfg(all(feature = "local", not(feature = "send")))]
pub use futures::future::LocalBoxFuture as PlatformFuture;

#[cfg(all(feature = "local", not(feature = "send")))]
pub trait MaybeSend {}
#[cfg(all(feature = "local", not(feature = "send")))]
impl<T> MaybeSend for T {}

#[cfg(all(feature = "local", not(feature = "send")))]
pub trait MaybeSync {}
#[cfg(all(feature = "local", not(feature = "send")))]
impl<T> MaybeSync for T {}

#[cfg(all(feature = "local", not(feature = "send")))]
pub type BoxedStrategy<T> = Box<dyn crate::streams::QueuingStrategy<T> + 'static>;

#[cfg(all(feature = "local", not(feature = "send")))]
pub(crate) type DynWritableTarget = dyn crate::streams::writable::ControllerTarget;

/// Boxes a driver future into the platform's future type.
pub(crate) fn boxed<F>(fut: F) -> PlatformFuture<'static, ()>
where
    F: std::future::Future<Output = ()> + MaybeSend + 'static,
{
    Box::pin(fut)
}
