use std::future::Future;
use std::pin::Pin;
use std::{
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::ControllerInner;

/// Future that resolves with the shutdown reason as soon as shutdown has
/// been triggered, regardless of outstanding delay tokens.
pub struct Triggered<T: Clone> {
	pub(crate) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Triggered<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mutex_inner = &self.as_ref().inner;
		let mut inner = mutex_inner.lock().expect("Lock acquired");

		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}

		// loops re-create this future every iteration; don't let their
		// wakers pile up
		if !inner
			.on_trigger
			.iter()
			.any(|waker| waker.will_wake(cx.waker()))
		{
			inner.on_trigger.push(cx.waker().clone());
		}
		Poll::Pending
	}
}
