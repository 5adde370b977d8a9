// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Logical sessions and transactions.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/sessions/driver-sessions.rst,
//! https://github.com/mongodb/specifications/blob/master/source/transactions/transactions.rst

use {
	crate::{
		Client,
		common::{Error, Result},
		doc,
		document::{Document, Timestamp},
		pool::Connection
	},
	rand::Rng
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionState {
	None,
	Starting,
	InProgress,
	Committed,
	Aborted
}

/// A server session handle. Carries the session id every operation run under
/// it is tagged with, the transaction state, and the connection the session
/// is pinned to while a transaction is in progress.
///
/// The pinned connection is a move-only handle, it leaves the session exactly
/// once, on commit, abort or drop.
pub struct ClientSession {
	client:             Client,
	lsid:               Document,
	txn_number:         i64,
	state:              TransactionState,
	pinned:             Option<Connection>,
	operation_time:     Option<Timestamp>,
	cluster_time:       Option<Document>,
	/// Poisoned sessions (network error mid-transaction) are not returned
	/// to the client's id pool.
	dirty:              bool
}

impl ClientSession {
	pub(crate) fn new(client: Client, lsid: Document) -> Self {
		Self {
			client,
			lsid,
			txn_number:     0,
			state:          TransactionState::None,
			pinned:         None,
			operation_time: None,
			cluster_time:   None,
			dirty:          false
		}
	}

	pub(crate) fn generate_lsid() -> Document {
		let mut id = [0u8; 16];
		rand::thread_rng().fill(&mut id);
		doc! { "id" => id.to_vec() }
	}

	pub fn id(&self) -> &Document {
		&self.lsid
	}

	pub fn transaction_state(&self) -> TransactionState {
		self.state
	}

	pub fn operation_time(&self) -> Option<Timestamp> {
		self.operation_time
	}

	pub fn cluster_time(&self) -> Option<&Document> {
		self.cluster_time.as_ref()
	}

	pub fn is_pinned(&self) -> bool {
		self.pinned.is_some()
	}

	/// The transaction number tagged onto retryable writes and transactions.
	pub(crate) fn next_txn_number(&mut self) -> i64 {
		self.txn_number += 1;
		self.txn_number
	}

	pub fn start_transaction(&mut self) -> Result<()> {
		match self.state {
			TransactionState::Starting | TransactionState::InProgress =>
				Err(Error::Transaction("transaction already in progress".to_string())),
			_ => {
				self.txn_number += 1;
				self.state = TransactionState::Starting;
				Ok(())
			}
		}
	}

	pub fn commit_transaction(&mut self) -> Result<()> {
		match self.state {
			TransactionState::None =>
				Err(Error::Transaction("no transaction started".to_string())),
			TransactionState::Aborted =>
				Err(Error::Transaction("cannot commit an aborted transaction".to_string())),
			// nothing ran yet, or an idempotent re-commit
			TransactionState::Starting | TransactionState::Committed => {
				self.state = TransactionState::Committed;
				self.release_pin();
				Ok(())
			}
			TransactionState::InProgress => {
				let result = self.end_transaction("commitTransaction");
				self.state = TransactionState::Committed;
				self.release_pin();
				result.map(drop)
			}
		}
	}

	pub fn abort_transaction(&mut self) -> Result<()> {
		match self.state {
			TransactionState::None =>
				Err(Error::Transaction("no transaction started".to_string())),
			TransactionState::Committed =>
				Err(Error::Transaction("cannot abort a committed transaction".to_string())),
			TransactionState::Aborted =>
				Err(Error::Transaction("transaction already aborted".to_string())),
			TransactionState::Starting => {
				self.state = TransactionState::Aborted;
				self.release_pin();
				Ok(())
			}
			TransactionState::InProgress => {
				// best effort, the server times the transaction out anyway
				if let Err(e) = self.end_transaction("abortTransaction") {
					log::debug!("abortTransaction failed: {}", e);
				}
				self.state = TransactionState::Aborted;
				self.release_pin();
				Ok(())
			}
		}
	}

	fn end_transaction(&mut self, name: &str) -> Result<Document> {
		let client = self.client.clone();
		let mut command = doc! { name => 1i32, "$db" => "admin" };
		self.prepare(&mut command);

		match self.pinned.as_mut() {
			Some(conn) => {
				let result = client.run_on_connection(conn, command);
				if matches!(result, Err(Error::Io(_))) {
					self.dirty = true;
				}
				result
			}
			None => Err(Error::Transaction("transaction lost its pinned connection".to_string()))
		}
	}

	/// Tags `command` with this session's id, cluster time and, inside a
	/// transaction, the transaction fields.
	pub(crate) fn prepare(&mut self, command: &mut Document) {
		command.insert("lsid", self.lsid.clone());

		if let Some(cluster_time) = &self.cluster_time {
			command.insert("$clusterTime", cluster_time.clone());
		}

		match self.state {
			TransactionState::Starting => {
				command.insert("txnNumber", self.txn_number);
				command.insert("startTransaction", true);
				command.insert("autocommit", false);
			}
			TransactionState::InProgress => {
				command.insert("txnNumber", self.txn_number);
				command.insert("autocommit", false);
			}
			_ => ()
		}
	}

	/// Advances causal-consistency state from a reply.
	pub(crate) fn observe(&mut self, reply: &Document) {
		if let Some(time) = reply.get("operationTime").and_then(|v| v.as_timestamp()) {
			if self.operation_time.map(|current| time > current).unwrap_or(true) {
				self.operation_time = Some(time);
			}
		}

		if let Some(cluster_time) = reply.get_document("$clusterTime") {
			let newer = match (&self.cluster_time, cluster_time.get("clusterTime")) {
				(Some(current), Some(time)) => current.get("clusterTime")
					.and_then(|v| v.as_timestamp()) < time.as_timestamp(),
				(None, _) => true,
				_ => false
			};
			if newer {
				self.cluster_time = Some(cluster_time.clone());
			}
		}
	}

	/// Moves the first operation's connection into the session, keeping the
	/// whole transaction on one server.
	pub(crate) fn pin(&mut self, connection: Connection) {
		self.pinned = Some(connection);
		if self.state == TransactionState::Starting {
			self.state = TransactionState::InProgress;
		}
	}

	pub(crate) fn pinned_mut(&mut self) -> Option<&mut Connection> {
		self.pinned.as_mut()
	}

	pub(crate) fn in_transaction(&self) -> bool {
		matches!(self.state, TransactionState::Starting | TransactionState::InProgress)
	}

	pub(crate) fn mark_dirty(&mut self) {
		self.dirty = true;
	}

	fn release_pin(&mut self) {
		// dropping the handle checks the connection back in
		self.pinned = None;
	}
}

impl Drop for ClientSession {
	fn drop(&mut self) {
		if self.in_transaction() {
			let _ = self.abort_transaction();
		}

		if !self.dirty {
			self.client.release_session_id(self.lsid.clone());
		}
	}
}

impl std::fmt::Debug for ClientSession {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("ClientSession")
			.field("lsid", &self.lsid)
			.field("txn_number", &self.txn_number)
			.field("state", &self.state)
			.field("pinned", &self.pinned.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			common::ClientOptions,
			transport::mock::{self, MockTransport}
		},
		std::str::FromStr
	};

	fn client() -> Client {
		let transport = MockTransport::new();
		transport.set(&"a:27017".parse().unwrap(), mock::server(mock::hello_standalone()));
		let options = ClientOptions::from_str(
			"mongodb://a:27017/?heartbeatFrequencyMS=20&serverSelectionTimeoutMS=2000").unwrap();
		Client::new(options, transport).unwrap()
	}

	#[test]
	fn transaction_state_transitions() {
		let client = client();
		let mut session = client.start_session().unwrap();
		assert_eq!(session.transaction_state(), TransactionState::None);

		assert!(matches!(session.commit_transaction(), Err(Error::Transaction(_))));
		assert!(matches!(session.abort_transaction(), Err(Error::Transaction(_))));

		session.start_transaction().unwrap();
		assert_eq!(session.transaction_state(), TransactionState::Starting);
		assert!(matches!(session.start_transaction(), Err(Error::Transaction(_))));

		// commit with no operations is a local no-op
		session.commit_transaction().unwrap();
		assert_eq!(session.transaction_state(), TransactionState::Committed);
		assert!(matches!(session.abort_transaction(), Err(Error::Transaction(_))));

		session.start_transaction().unwrap();
		session.abort_transaction().unwrap();
		assert_eq!(session.transaction_state(), TransactionState::Aborted);
		assert!(matches!(session.abort_transaction(), Err(Error::Transaction(_))));
		assert!(matches!(session.commit_transaction(), Err(Error::Transaction(_))));

		client.close();
	}

	#[test]
	fn txn_numbers_are_monotonic() {
		let client = client();
		let mut session = client.start_session().unwrap();

		session.start_transaction().unwrap();
		let first = session.txn_number;
		session.commit_transaction().unwrap();
		session.start_transaction().unwrap();
		assert_eq!(session.txn_number, first + 1);
		session.abort_transaction().unwrap();

		client.close();
	}

	#[test]
	fn lsids_are_distinct_and_reused_after_end() {
		let client = client();

		let a = client.start_session().unwrap().id().clone();
		let b = {
			let first = client.start_session().unwrap();
			let second = client.start_session().unwrap();
			assert_ne!(first.id(), second.id());
			first.id().clone()
		};

		// the most recently ended session's id comes back first
		let reused = client.start_session().unwrap();
		assert!(reused.id() == &a || reused.id() == &b);

		client.close();
	}

	#[test]
	fn observes_cluster_and_operation_time() {
		let client = client();
		let mut session = client.start_session().unwrap();

		let newer = Timestamp { time: 10, increment: 1 };
		let older = Timestamp { time: 5, increment: 9 };

		session.observe(&doc! {
			"ok"            => 1.0,
			"operationTime" => newer,
			"$clusterTime"  => doc! { "clusterTime" => newer }
		});
		assert_eq!(session.operation_time(), Some(newer));

		session.observe(&doc! { "ok" => 1.0, "operationTime" => older });
		assert_eq!(session.operation_time(), Some(newer));

		assert_eq!(
			session.cluster_time().and_then(|ct| ct.get("clusterTime")).and_then(|v| v.as_timestamp()),
			Some(newer));

		client.close();
	}
}
