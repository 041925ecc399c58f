//! Unconfirmed transaction pool boundary.

use std::sync::Mutex;

use crate::types::{Signature, Transaction};

pub trait TransactionPool: Send + Sync {
	/// Unconfirmed transactions in their existing priority order.
	fn unconfirmed(&self) -> Vec<Transaction>;

	/// Drops transactions confirmed elsewhere.
	fn remove(&self, signatures: &[Signature]);

	/// Drops transactions whose deadline has passed; returns how many.
	fn remove_expired(&self, now: u64) -> usize;
}

/// In-memory pool keeping submission order as priority order.
#[derive(Default)]
pub struct MemoryPool {
	transactions: Mutex<Vec<Transaction>>,
}

impl MemoryPool {
	pub fn new() -> Self {
		MemoryPool::default()
	}

	pub fn add(&self, transaction: Transaction) {
		let mut transactions = self.transactions.lock().expect("Lock acquired");
		if transactions
			.iter()
			.any(|known| known.signature == transaction.signature)
		{
			return;
		}
		transactions.push(transaction);
	}
}

impl TransactionPool for MemoryPool {
	fn unconfirmed(&self) -> Vec<Transaction> {
		self.transactions.lock().expect("Lock acquired").clone()
	}

	fn remove(&self, signatures: &[Signature]) {
		let mut transactions = self.transactions.lock().expect("Lock acquired");
		transactions.retain(|transaction| !signatures.contains(&transaction.signature));
	}

	fn remove_expired(&self, now: u64) -> usize {
		let mut transactions = self.transactions.lock().expect("Lock acquired");
		let before = transactions.len();
		transactions.retain(|transaction| transaction.deadline > now);
		before - transactions.len()
	}
}
