use std::future::Future;
use std::pin::Pin;
use std::{
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::ControllerInner;

/// Future for a fully completed shutdown.
///
/// Resolves with the shutdown reason once a reason has been set and every
/// delay token has been dropped; pending otherwise, re-registering the
/// context's waker for wake-up on completion.
pub struct Completed<T: Clone> {
	pub(crate) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mutex_inner = &self.as_ref().inner;
		let mut inner = mutex_inner.lock().expect("Lock acquired");

		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}

		// re-register unless an equivalent waker is already queued, so
		// repeated polls from the same task don't pile wakers up
		if !inner
			.on_shutdown_complete
			.iter()
			.any(|waker| waker.will_wake(cx.waker()))
		{
			inner.on_shutdown_complete.push(cx.waker().clone());
		}
		Poll::Pending
	}
}
