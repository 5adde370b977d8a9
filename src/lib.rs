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

#![warn(clippy::all)]
#![forbid(unsafe_code)]

//! MongoDB driver core: connection pooling, server discovery and monitoring,
//! server selection, sessions and the retry policy.
//!
//! Wire-protocol encoding and authentication live behind the
//! [`transport::Transport`] seam, this crate works entirely in terms of
//! command and reply [`Document`]s.

pub mod common;
pub mod document;
pub mod transport;
pub mod apm;
pub mod pool;
pub mod topology;
pub mod monitor;
pub mod session;
pub mod cursor;

pub use self::{
	common::*,
	cursor::{CancellationToken, Cursor},
	document::{Document, ObjectId, Timestamp, Value},
	session::{ClientSession, TransactionState}
};

use {
	crate::{
		apm::{Event, EventBus, EventListener},
		cursor::CursorReply,
		pool::Connection,
		topology::Topology,
		transport::Transport
	},
	std::sync::{
		Arc, Mutex,
		atomic::{AtomicBool, AtomicI32, Ordering}
	}
};

const RETRYABLE_WRITE_COMMANDS: &[&str] = &["insert", "update", "delete", "findAndModify"];
const RETRYABLE_READ_COMMANDS:  &[&str] = &[
	"find", "aggregate", "count", "distinct", "listCollections", "listDatabases", "listIndexes"
];

#[derive(Clone)]
pub struct Client(Arc<ClientInner>);

pub struct ClientInner {
	pub options: ClientOptions,
	topology:    Topology,
	events:      Arc<EventBus>,
	request_id:  AtomicI32,
	closed:      AtomicBool,
	/// Released session ids, reused most-recent-first.
	session_ids: Mutex<Vec<Document>>
}

impl std::ops::Deref for Client {
	type Target = ClientInner;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl Client {
	pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Self> {
		options.validate()?;
		let events = Arc::new(EventBus::new());
		let topology = Topology::new(&options, transport, events.clone());

		Ok(Self(Arc::new(ClientInner {
			options,
			topology,
			events,
			request_id:  AtomicI32::new(1),
			closed:      AtomicBool::new(false),
			session_ids: Mutex::new(Vec::new())
		})))
	}

	pub fn with_uri(uri: &str, transport: Arc<dyn Transport>) -> Result<Self> {
		Self::new(uri.parse()?, transport)
	}

	pub fn add_event_listener(&self, listener: EventListener) {
		self.events.subscribe(listener);
	}

	pub fn topology(&self) -> &Topology {
		&self.topology
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Shuts the client down: stops the monitors, drains and closes every
	/// pool, then emits `TopologyClosed`. Idempotent. Blocks until pinned
	/// connections have been released.
	pub fn close(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			self.topology.close();
		}
	}

	pub fn start_session(&self) -> Result<ClientSession> {
		if self.is_closed() {
			return Err(Error::ClientClosed);
		}
		Ok(ClientSession::new(self.clone(), self.take_session_id()))
	}

	fn implicit_session(&self) -> ClientSession {
		ClientSession::new(self.clone(), self.take_session_id())
	}

	fn take_session_id(&self) -> Document {
		self.session_ids.lock().ok()
			.and_then(|mut ids| ids.pop())
			.unwrap_or_else(ClientSession::generate_lsid)
	}

	pub(crate) fn release_session_id(&self, lsid: Document) {
		if !self.is_closed() {
			if let Ok(mut ids) = self.session_ids.lock() {
				ids.push(lsid);
			}
		}
	}

	/// Runs a command under an implicit session, with the configured read
	/// preference and the retry policy.
	pub fn run_command(&self, db: &str, command: Document) -> Result<Document> {
		let read_preference = self.options.read_preference.clone();
		self.execute(db, command, &read_preference, None).map(|(_, reply)| reply)
	}

	pub fn run_command_with_session(
		&self,
		db:      &str,
		command: Document,
		session: &mut ClientSession
	) -> Result<Document> {
		let read_preference = self.options.read_preference.clone();
		self.execute(db, command, &read_preference, Some(session)).map(|(_, reply)| reply)
	}

	/// Runs a cursor-returning command and wraps the reply in a [`Cursor`]
	/// bound to the server that created it.
	pub fn run_cursor_command(&self, db: &str, command: Document) -> Result<Cursor> {
		let batch_size = command.get_i64("batchSize");
		let read_preference = self.options.read_preference.clone();
		let (address, reply) = self.execute(db, command, &read_preference, None)?;
		let reply: CursorReply = reply.deserialize()?;
		Ok(Cursor::new(self.clone(), address, reply.cursor, batch_size))
	}

	/// Runs a command against one specific server, for `getMore` and
	/// `killCursors` which must go back to the cursor's server.
	pub(crate) fn run_command_at(&self, address: &ServerAddress, command: Document) -> Result<Document> {
		if self.is_closed() {
			return Err(Error::ClientClosed);
		}

		let pool = self.topology.pool(address)
			.ok_or_else(|| Error::network("server is no longer part of the topology"))?;
		let mut conn = pool.check_out(self.options.pool_options.wait_queue_timeout)?;

		let result = self.run_on_connection(&mut conn, command);
		if let Err(e) = &result {
			self.topology.handle_application_error(address, e);
		}
		result
	}

	/// One round trip with command-monitoring events and the `ok` check.
	pub(crate) fn run_on_connection(&self, conn: &mut Connection, command: Document) -> Result<Document> {
		let address = conn.address().clone();
		let request_id = self.request_id.fetch_add(1, Ordering::SeqCst);
		let command_name = command.command_name().unwrap_or("").to_string();

		self.events.publish(Event::CommandStarted {
			address:      address.clone(),
			request_id,
			command_name: command_name.clone(),
			command:      command.clone()
		});

		let fail = |error: &Error| self.events.publish(Event::CommandFailed {
			address:      address.clone(),
			request_id,
			command_name: command_name.clone(),
			failure:      error.to_string()
		});

		let reply = match conn.round_trip(&command) {
			Ok(reply) => reply,
			Err(e) => {
				fail(&e);
				return Err(e);
			}
		};

		let generic: GenericReply = match reply.deserialize() {
			Ok(generic) => generic,
			Err(e) => {
				let e = Error::from(e);
				fail(&e);
				return Err(e);
			}
		};

		if generic.ok != 1.0 {
			let e = Error::from(generic);
			fail(&e);
			return Err(e);
		}

		self.events.publish(Event::CommandSucceeded {
			address,
			request_id,
			command_name,
			reply: reply.clone()
		});
		Ok(reply)
	}

	/// Whether the retry policy applies to `command` at all, before the
	/// per-attempt error classification.
	fn retry_allowed(&self, command_name: &str) -> bool {
		if RETRYABLE_WRITE_COMMANDS.contains(&command_name) {
			self.options.retry_writes
		} else if RETRYABLE_READ_COMMANDS.contains(&command_name) {
			self.options.retry_reads
		} else {
			false
		}
	}

	/// Selects a server, attaches session fields and runs the command,
	/// retrying retryable operations exactly once against a freshly
	/// selected server.
	fn execute(
		&self,
		db:              &str,
		mut command:     Document,
		read_preference: &ReadPreference,
		mut session:     Option<&mut ClientSession>
	) -> Result<(ServerAddress, Document)> {
		if self.is_closed() {
			return Err(Error::ClientClosed);
		}

		command.insert("$db", db);
		let command_name = command.command_name().unwrap_or("").to_string();
		let in_transaction = session.as_deref().map(ClientSession::in_transaction).unwrap_or(false);
		let is_write = RETRYABLE_WRITE_COMMANDS.contains(&command_name.as_str());
		let retryable = !in_transaction && self.retry_allowed(&command_name);

		// operations inside a transaction stay on the pinned connection

		if let Some(s) = session.as_deref_mut() {
			if s.in_transaction() && s.is_pinned() {
				let mut cmd = command.clone();
				s.prepare(&mut cmd);

				let conn = match s.pinned_mut() {
					Some(conn) => conn,
					None => return Err(Error::Transaction("transaction lost its pinned connection".to_string()))
				};
				let address = conn.address().clone();

				return match self.run_on_connection(conn, cmd) {
					Ok(reply) => {
						s.observe(&reply);
						Ok((address, reply))
					}
					Err(e) => {
						if matches!(e, Error::Io(_)) {
							s.mark_dirty();
						}
						self.topology.handle_application_error(&address, &e);
						Err(e)
					}
				};
			}
		}

		let mut implicit: Option<ClientSession> = None;
		let mut txn_number: Option<i64> = None;

		// writes are only eligible on a primary, the configured preference
		// applies to reads
		let primary = ReadPreference::default();
		let read_preference = if is_write { &primary } else { read_preference };

		for attempt in 0.. {
			let (address, pool) = self.topology.select_server(read_preference)?;
			let supports_sessions = self.topology.description().supports_sessions();

			let mut cmd = command.clone();
			if supports_sessions {
				let effective = match session.as_deref_mut() {
					Some(s) => s,
					None => implicit.get_or_insert_with(|| self.implicit_session())
				};
				effective.prepare(&mut cmd);

				// retryable writes reuse the same transaction number across
				// both attempts
				if retryable && is_write {
					let number = *txn_number.get_or_insert_with(|| effective.next_txn_number());
					cmd.insert("txnNumber", number);
				}
			}

			let mut conn = pool.check_out(self.options.pool_options.wait_queue_timeout)?;

			match self.run_on_connection(&mut conn, cmd) {
				Ok(reply) => {
					match session.as_deref_mut() {
						Some(s) => {
							s.observe(&reply);
							if s.in_transaction() && !s.is_pinned() {
								s.pin(conn);
							}
						}
						None => if let Some(s) = implicit.as_mut() {
							s.observe(&reply);
						}
					}
					return Ok((address, reply));
				}
				Err(e) => {
					self.topology.handle_application_error(&address, &e);

					if attempt > 0 || !retryable || !supports_sessions || !e.is_retryable() {
						return Err(e);
					}
					log::debug!("retrying {} after: {}", command_name, e);
				}
			}
		}

		unreachable!()
	}
}
