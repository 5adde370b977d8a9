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

//! Application performance monitoring: command, connection-pool and topology
//! events, published through a per-client [`EventBus`].
//!
//! see https://github.com/mongodb/specifications/blob/master/source/command-monitoring/command-monitoring.rst,
//! https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst,
//! https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring-logging-and-monitoring.rst

use {
	crate::{
		common::ServerAddress,
		document::{Document, ObjectId},
		topology::{ServerDescription, TopologyDescription}
	},
	std::sync::{Arc, RwLock, atomic::{AtomicBool, Ordering}}
};

pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Fans events out to the listeners registered on one client. Publishing is
/// a no-op until the first listener subscribes.
#[derive(Default)]
pub struct EventBus {
	listeners: RwLock<Vec<EventListener>>,
	active:    AtomicBool
}

impl EventBus {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self, listener: EventListener) {
		self.listeners.write().unwrap().push(listener);
		self.active.store(true, Ordering::Release);
	}

	pub fn publish(&self, event: Event) {
		if !self.active.load(Ordering::Acquire) {
			return;
		}

		for listener in self.listeners.read().unwrap().iter() {
			listener(&event);
		}
	}
}

impl std::fmt::Debug for EventBus {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("EventBus")
			.field("listeners", &self.listeners.read().unwrap().len())
			.finish()
	}
}

#[derive(Debug, Clone)]
pub enum Event {
	// command monitoring

	CommandStarted {
		address:      ServerAddress,
		request_id:   i32,
		command_name: String,
		command:      Document
	},
	CommandSucceeded {
		address:      ServerAddress,
		request_id:   i32,
		command_name: String,
		reply:        Document
	},
	CommandFailed {
		address:      ServerAddress,
		request_id:   i32,
		command_name: String,
		failure:      String
	},

	// connection pool

	PoolCreated {
		address: ServerAddress
	},
	PoolCleared {
		address:    ServerAddress,
		generation: u64
	},
	PoolClosed {
		address: ServerAddress
	},
	ConnectionCreated {
		address:       ServerAddress,
		connection_id: u64
	},
	ConnectionReady {
		address:       ServerAddress,
		connection_id: u64
	},
	ConnectionClosed {
		address:       ServerAddress,
		connection_id: u64,
		reason:        ConnectionClosedReason
	},
	ConnectionCheckOutStarted {
		address: ServerAddress
	},
	ConnectionCheckOutFailed {
		address: ServerAddress,
		reason:  ConnectionCheckOutFailedReason
	},
	ConnectionCheckedOut {
		address:       ServerAddress,
		connection_id: u64
	},
	ConnectionCheckedIn {
		address:       ServerAddress,
		connection_id: u64
	},

	// topology

	TopologyOpening {
		topology_id: ObjectId
	},
	TopologyDescriptionChanged {
		topology_id: ObjectId,
		previous:    Arc<TopologyDescription>,
		new:         Arc<TopologyDescription>
	},
	TopologyClosed {
		topology_id: ObjectId
	},
	ServerOpening {
		topology_id: ObjectId,
		address:     ServerAddress
	},
	ServerDescriptionChanged {
		topology_id: ObjectId,
		address:     ServerAddress,
		previous:    Box<ServerDescription>,
		new:         Box<ServerDescription>
	},
	ServerClosed {
		topology_id: ObjectId,
		address:     ServerAddress
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionClosedReason {
	/// The pool generation moved past the connection's.
	Stale,
	/// The connection sat idle longer than `max_idle_time`.
	Idle,
	/// The connection experienced a network error.
	Error,
	/// The owning pool closed.
	PoolClosed
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCheckOutFailedReason {
	PoolClosed,
	Timeout,
	Error
}

#[cfg(test)]
mod tests {
	use {super::*, std::sync::Mutex};

	#[test]
	fn publishes_to_all_listeners() {
		let bus = EventBus::new();
		let seen = Arc::new(Mutex::new(Vec::new()));

		for _ in 0..2 {
			let seen = seen.clone();
			bus.subscribe(Arc::new(move |event| {
				if let Event::PoolCreated { address } = event {
					seen.lock().unwrap().push(address.clone());
				}
			}));
		}

		bus.publish(Event::PoolCreated { address: ServerAddress::new("a", 1) });
		assert_eq!(seen.lock().unwrap().len(), 2);
	}

	#[test]
	fn publish_without_listeners_is_noop() {
		EventBus::new().publish(Event::TopologyOpening { topology_id: ObjectId::new() });
	}
}
