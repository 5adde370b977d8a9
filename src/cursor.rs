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

//! Batched command cursors.

use {
	crate::{
		Client,
		common::{Result, ServerAddress},
		doc,
		document::{Document, Value}
	},
	std::{
		collections::VecDeque,
		sync::{Arc, atomic::{AtomicBool, Ordering}}
	},
	serde::Deserialize
};

/// Cooperative cancellation for a [`Cursor`]. Cancelling stops further
/// `getMore` round trips, documents already buffered are still yielded.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorReply {
	pub cursor: CursorBody
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct CursorBody {
	pub id:          i64,
	pub ns:          String,
	pub first_batch: Vec<Document>,
	pub next_batch:  Vec<Document>
}

/// Iterates the documents of a cursor-returning command, fetching further
/// batches with `getMore` against the server the cursor was created on.
///
/// The cursor is closed the moment the server reports id 0, iteration ends
/// right there without an extra round trip. A cursor dropped before
/// exhaustion closes itself server-side with a best-effort `killCursors`.
pub struct Cursor {
	client:     Client,
	address:    ServerAddress,
	id:         i64,
	db:         String,
	collection: String,
	batch_size: Option<i64>,
	buffer:     VecDeque<Document>,
	token:      CancellationToken
}

impl Cursor {
	pub(crate) fn new(
		client:     Client,
		address:    ServerAddress,
		body:       CursorBody,
		batch_size: Option<i64>
	) -> Self {
		let (db, collection) = match body.ns.find('.') {
			Some(i) => (body.ns[..i].to_string(), body.ns[i + 1..].to_string()),
			None    => (body.ns.clone(), String::new())
		};

		Self {
			client,
			address,
			id: body.id,
			db,
			collection,
			batch_size,
			buffer: body.first_batch.into(),
			token:  CancellationToken::new()
		}
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.token.clone()
	}

	pub fn id(&self) -> i64 {
		self.id
	}

	pub fn is_exhausted(&self) -> bool {
		self.id == 0 && self.buffer.is_empty()
	}

	fn get_more(&mut self) -> Result<()> {
		let mut command = doc! {
			"getMore"    => self.id,
			"collection" => self.collection.as_str(),
			"$db"        => self.db.as_str()
		};
		if let Some(batch_size) = self.batch_size {
			command.insert("batchSize", batch_size);
		}

		let reply = self.client.run_command_at(&self.address, command)?;
		let reply: CursorReply = reply.deserialize()?;
		self.id = reply.cursor.id;
		self.buffer.extend(reply.cursor.next_batch);
		Ok(())
	}
}

impl Iterator for Cursor {
	type Item = Result<Document>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if let Some(doc) = self.buffer.pop_front() {
				return Some(Ok(doc));
			}

			if self.id == 0 || self.token.is_cancelled() {
				return None;
			}

			if let Err(e) = self.get_more() {
				self.id = 0;
				return Some(Err(e));
			}
		}
	}
}

impl Drop for Cursor {
	fn drop(&mut self) {
		if self.id == 0 {
			return;
		}

		let command = doc! {
			"killCursors" => self.collection.as_str(),
			"cursors"     => vec![Value::I64(self.id)],
			"$db"         => self.db.as_str()
		};

		if let Err(e) = self.client.run_command_at(&self.address, command) {
			log::warn!("failed to close cursor {} on {}: {}", self.id, self.address, e);
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			common::ClientOptions,
			document::Value,
			transport::mock::{self, MockTransport}
		},
		std::{str::FromStr, sync::Mutex}
	};

	fn batch(from: i64, to: i64) -> Vec<Value> {
		(from..to).map(|n| Value::Document(doc! { "n" => n })).collect()
	}

	/// A server with one cursor over the documents 0..9, served in batches
	/// of three.
	fn cursor_server(transport: &MockTransport, address: &ServerAddress) {
		let position = Arc::new(Mutex::new(3i64));
		transport.set(address, Arc::new(move |request| Ok(match request.command_name() {
			Some("hello") => mock::hello_standalone(),
			Some("find") => doc! {
				"ok"     => 1.0,
				"cursor" => doc! {
					"id"         => 42i64,
					"ns"         => "test.items",
					"firstBatch" => batch(0, 3)
				}
			},
			Some("getMore") => {
				let mut position = position.lock().unwrap();
				let from = *position;
				*position += 3;
				doc! {
					"ok"     => 1.0,
					"cursor" => doc! {
						"id"        => if from + 3 >= 9 { 0i64 } else { 42i64 },
						"ns"        => "test.items",
						"nextBatch" => batch(from, (from + 3).min(9))
					}
				}
			}
			_ => doc! { "ok" => 1.0 }
		})));
	}

	fn client(transport: &Arc<MockTransport>) -> (Client, ServerAddress) {
		let address: ServerAddress = "a:27017".parse().unwrap();
		cursor_server(transport, &address);
		let options = ClientOptions::from_str(
			"mongodb://a:27017/?heartbeatFrequencyMS=20&serverSelectionTimeoutMS=2000").unwrap();
		(Client::new(options, transport.clone()).unwrap(), address)
	}

	#[test]
	fn iterates_all_batches_and_closes_eagerly() {
		let transport = MockTransport::new();
		let (client, _) = client(&transport);

		let cursor = client.run_cursor_command("test", doc! { "find" => "items" }).unwrap();
		let docs: Result<Vec<Document>> = cursor.collect();
		let docs = docs.unwrap();

		assert_eq!(docs.len(), 9);
		assert_eq!(docs[0].get_i64("n"), Some(0));
		assert_eq!(docs[8].get_i64("n"), Some(8));

		// id reached 0 on the last getMore, no killCursors on drop
		assert!(transport.commands_named("killCursors").is_empty());
		assert_eq!(transport.commands_named("getMore").len(), 2);

		client.close();
	}

	#[test]
	fn cancellation_yields_buffered_documents_only() {
		let transport = MockTransport::new();
		let (client, _) = client(&transport);

		let mut cursor = client.run_cursor_command("test", doc! { "find" => "items" }).unwrap();
		let token = cursor.cancellation_token();

		assert_eq!(cursor.next().unwrap().unwrap().get_i64("n"), Some(0));
		token.cancel();

		// the remaining buffered documents still come out
		assert_eq!(cursor.next().unwrap().unwrap().get_i64("n"), Some(1));
		assert_eq!(cursor.next().unwrap().unwrap().get_i64("n"), Some(2));
		assert!(cursor.next().is_none());
		assert!(transport.commands_named("getMore").is_empty());

		// still open server-side, drop closes it
		drop(cursor);
		assert_eq!(transport.commands_named("killCursors").len(), 1);

		client.close();
	}

	#[test]
	fn drop_kills_open_cursor() {
		let transport = MockTransport::new();
		let (client, _) = client(&transport);

		let cursor = client.run_cursor_command("test", doc! { "find" => "items" }).unwrap();
		drop(cursor);

		let kills = transport.commands_named("killCursors");
		assert_eq!(kills.len(), 1);
		assert_eq!(kills[0].get_str("killCursors"), Some("items"));

		client.close();
	}
}
