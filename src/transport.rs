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

//! The seam between the core and the wire-protocol collaborator.
//!
//! The core never encodes BSON or touches sockets itself, it hands a command
//! [`Document`] to a [`Channel`] and gets the reply back as a `Document`.

use crate::{common::{Result, ServerAddress}, document::Document};

/// Opens channels to servers. Implemented by the wire-protocol collaborator,
/// shared by the client, its pools and its monitors.
pub trait Transport: Send + Sync + 'static {
	fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Channel>>;
}

/// A single established connection to one server.
pub trait Channel: Send {
	/// Sends one command and waits for its reply.
	fn round_trip(&mut self, request: &Document) -> Result<Document>;

	/// Releases the underlying resources. Called at most once.
	fn close(&mut self) {}
}

#[cfg(test)]
pub(crate) mod mock {
	use {
		super::*,
		crate::{doc, common::Error, document::Value},
		std::{
			collections::HashMap,
			sync::{Arc, Mutex, atomic::{AtomicUsize, Ordering}}
		}
	};

	pub type Responder = Arc<dyn Fn(&Document) -> Result<Document> + Send + Sync>;

	/// A scripted in-memory transport. Each address maps to a responder
	/// closure, every round trip is recorded in a shared command log.
	/// Channels consult the map on every round trip, so taking a server
	/// down also fails its established connections.
	#[derive(Default)]
	pub struct MockTransport {
		servers:  Arc<Mutex<HashMap<ServerAddress, Responder>>>,
		log:      Arc<Mutex<Vec<(ServerAddress, Document)>>>,
		connects: AtomicUsize
	}

	impl MockTransport {
		pub fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		/// Installs `responder` for `address`, replacing any previous one.
		pub fn set(&self, address: &ServerAddress, responder: Responder) {
			self.servers.lock().unwrap().insert(address.clone(), responder);
		}

		/// Removes the responder, subsequent connects and round trips to
		/// `address` fail with a network error.
		pub fn take_down(&self, address: &ServerAddress) {
			self.servers.lock().unwrap().remove(address);
		}

		pub fn connect_count(&self) -> usize {
			self.connects.load(Ordering::SeqCst)
		}

		/// Commands sent so far, in order, with the address they went to.
		pub fn log(&self) -> Vec<(ServerAddress, Document)> {
			self.log.lock().unwrap().clone()
		}

		pub fn commands_named(&self, name: &str) -> Vec<Document> {
			self.log.lock().unwrap().iter()
				.filter(|(_, doc)| doc.command_name() == Some(name))
				.map(|(_, doc)| doc.clone())
				.collect()
		}
	}

	impl Transport for MockTransport {
		fn connect(&self, address: &ServerAddress) -> Result<Box<dyn Channel>> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			if !self.servers.lock().unwrap().contains_key(address) {
				return Err(Error::network("connection refused"));
			}
			Ok(Box::new(MockChannel {
				address: address.clone(),
				servers: self.servers.clone(),
				log:     self.log.clone()
			}))
		}
	}

	pub struct MockChannel {
		address: ServerAddress,
		servers: Arc<Mutex<HashMap<ServerAddress, Responder>>>,
		log:     Arc<Mutex<Vec<(ServerAddress, Document)>>>
	}

	impl Channel for MockChannel {
		fn round_trip(&mut self, request: &Document) -> Result<Document> {
			self.log.lock().unwrap().push((self.address.clone(), request.clone()));
			let responder = self.servers.lock().unwrap().get(&self.address)
				.ok_or_else(|| Error::network("connection reset"))?
				.clone();
			(responder)(request)
		}
	}

	/// A responder that answers every command with `reply`.
	pub fn always(reply: Document) -> Responder {
		Arc::new(move |_| Ok(reply.clone()))
	}

	/// A responder that answers `hello` with `hello` and everything else
	/// with `{ok: 1}`.
	pub fn server(hello: Document) -> Responder {
		Arc::new(move |request| Ok(match request.command_name() {
			Some("hello") | Some("isMaster") => hello.clone(),
			_ => doc! { "ok" => 1.0 }
		}))
	}

	/// A responder that fails the first `n` non-hello commands with the
	/// given server error, then delegates to `inner`.
	pub fn fail_first(n: usize, code: i32, errmsg: &str, inner: Responder) -> Responder {
		let remaining = AtomicUsize::new(n);
		let errmsg = errmsg.to_string();
		Arc::new(move |request| {
			let hello = matches!(request.command_name(), Some("hello") | Some("isMaster"));
			if !hello && remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst,
				|v| v.checked_sub(1)).is_ok()
			{
				return Ok(doc! { "ok" => 0.0, "code" => code, "errmsg" => errmsg.as_str() });
			}
			(inner)(request)
		})
	}

	pub fn hello_standalone() -> Document {
		doc! {
			"ok"                           => 1.0,
			"isWritablePrimary"            => true,
			"minWireVersion"               => 0i32,
			"maxWireVersion"               => 17i32,
			"logicalSessionTimeoutMinutes" => 30i32
		}
	}

	pub fn hello_rs_primary(set_name: &str, me: &str, hosts: &[&str]) -> Document {
		doc! {
			"ok"                           => 1.0,
			"isWritablePrimary"            => true,
			"setName"                      => set_name,
			"setVersion"                   => 1i32,
			"me"                           => me,
			"hosts"                        => hosts.iter().map(|h| Value::from(*h)).collect::<Vec<_>>(),
			"minWireVersion"               => 0i32,
			"maxWireVersion"               => 17i32,
			"logicalSessionTimeoutMinutes" => 30i32
		}
	}

	pub fn hello_rs_secondary(set_name: &str, me: &str, hosts: &[&str], primary: Option<&str>) -> Document {
		let mut doc = doc! {
			"ok"                           => 1.0,
			"isWritablePrimary"            => false,
			"secondary"                    => true,
			"setName"                      => set_name,
			"setVersion"                   => 1i32,
			"me"                           => me,
			"hosts"                        => hosts.iter().map(|h| Value::from(*h)).collect::<Vec<_>>(),
			"minWireVersion"               => 0i32,
			"maxWireVersion"               => 17i32,
			"logicalSessionTimeoutMinutes" => 30i32
		};
		if let Some(primary) = primary {
			doc.insert("primary", primary);
		}
		doc
	}
}
