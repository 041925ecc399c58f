//! Cooperative shutdown controller.
//!
//! A [`Controller`] is cloned into every long-running task. Any clone may
//! trigger shutdown with a reason; loops either poll [`Controller::is_triggered`]
//! at their cancellation points or wrap whole futures in
//! [`Controller::with_cancel`]. [`Controller::completed_shutdown`] resolves
//! once shutdown was triggered and every outstanding [`DelayToken`] has been
//! dropped, letting the process exit only after graceful cleanup.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::Waker;

mod completed;
mod triggered;
mod utils;

pub use completed::Completed;
pub use triggered::Triggered;

#[derive(Debug, thiserror::Error)]
#[error("shutdown has already started")]
pub struct ShutdownHasStarted;

pub struct ControllerInner<T> {
	reason: Option<T>,
	delay_tokens: usize,
	on_trigger: Vec<Waker>,
	on_shutdown_complete: Vec<Waker>,
}

pub struct Controller<T: Clone> {
	pub(crate) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Controller {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Controller::new()
	}
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Controller {
			inner: Arc::new(Mutex::new(ControllerInner {
				reason: None,
				delay_tokens: 0,
				on_trigger: Vec::new(),
				on_shutdown_complete: Vec::new(),
			})),
		}
	}

	/// Starts the shutdown, waking every waiter. Only the first caller
	/// gets to set the reason.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		if inner.reason.is_some() {
			return Err(ShutdownHasStarted);
		}
		inner.reason = Some(reason);
		for waker in inner.on_trigger.drain(..) {
			waker.wake();
		}
		for waker in inner.on_shutdown_complete.drain(..) {
			waker.wake();
		}
		Ok(())
	}

	pub fn is_triggered(&self) -> bool {
		self.inner.lock().expect("Lock acquired").reason.is_some()
	}

	/// Future that resolves with the shutdown reason once triggered.
	pub fn triggered_shutdown(&self) -> Triggered<T> {
		Triggered {
			inner: self.inner.clone(),
		}
	}

	/// Runs `future` until completion or shutdown, whichever comes first.
	/// Takes the controller by value so the combined future can be spawned.
	pub async fn with_cancel<F: Future>(self, future: F) -> Result<F::Output, T> {
		tokio::select! {
			reason = self.triggered_shutdown() => Err(reason),
			output = future => Ok(output),
		}
	}

	/// Runs `future` to completion, then triggers shutdown with `reason`.
	/// Used for tasks whose exit means the node cannot keep running.
	pub async fn with_trigger<F: Future>(self, reason: T, future: F) -> F::Output {
		let output = future.await;
		let _ = self.trigger_shutdown(reason);
		output
	}

	/// Future that resolves with the reason once shutdown was triggered
	/// and all delay tokens have been dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Holds shutdown completion open until the returned token is dropped.
	pub fn delay_token(&self) -> DelayToken<T> {
		let mut inner = self.inner.lock().expect("Lock acquired");
		inner.delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}

	/// Waits for SIGINT/SIGTERM and triggers shutdown with `reason`.
	/// Takes the controller by value so the future can be spawned.
	pub async fn on_user_signal(self, reason: T) {
		utils::user_signal().await;
		let _ = self.trigger_shutdown(reason);
	}
}

/// Token that delays shutdown completion while alive.
pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		let mut inner = self.inner.lock().expect("Lock acquired");
		inner.delay_tokens -= 1;
		if inner.delay_tokens == 0 && inner.reason.is_some() {
			for waker in inner.on_shutdown_complete.drain(..) {
				waker.wake();
			}
		}
	}
}
