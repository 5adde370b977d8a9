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

//! Per-server connection pool.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/connection-monitoring-and-pooling/connection-monitoring-and-pooling.rst

use {
	crate::{
		apm::{Event, EventBus, ConnectionClosedReason, ConnectionCheckOutFailedReason},
		common::{Error, Result, ConnectionPoolOptions, ServerAddress},
		document::Document,
		transport::{Channel, Transport}
	},
	std::{
		collections::VecDeque,
		sync::{Arc, Condvar, Mutex},
		time::{Duration, Instant}
	}
};

/// A pool of connections to a single server.
///
/// Checkout blocks on a condvar while the pool is at `max_pool_size` with no
/// idle connection, and is woken by check-ins and capacity changes. A
/// generation counter invalidates idle connections wholesale: `clear` bumps
/// it, and connections carrying an older generation are closed instead of
/// reused when they resurface.
#[derive(Clone)]
pub struct ConnectionPool(Arc<PoolInner>);

struct PoolInner {
	address:   ServerAddress,
	options:   ConnectionPoolOptions,
	transport: Arc<dyn Transport>,
	events:    Arc<EventBus>,
	state:     Mutex<PoolState>,
	/// Signaled when an idle connection or capacity becomes available,
	/// and on close so blocked checkouts fail fast.
	available: Condvar,
	/// Signaled when the last outstanding connection checks in during close.
	drained:   Condvar
}

struct PoolState {
	idle:        VecDeque<IdleConnection>,
	/// Idle plus checked-out connections.
	total:       usize,
	checked_out: usize,
	generation:  u64,
	next_id:     u64,
	closing:     bool,
	closed:      bool
}

struct IdleConnection {
	id:         u64,
	generation: u64,
	channel:    Box<dyn Channel>,
	since:      Instant
}

impl ConnectionPool {
	pub fn new(
		address:   ServerAddress,
		options:   ConnectionPoolOptions,
		transport: Arc<dyn Transport>,
		events:    Arc<EventBus>
	) -> Self {
		events.publish(Event::PoolCreated { address: address.clone() });
		Self(Arc::new(PoolInner {
			address,
			options,
			transport,
			events,
			state: Mutex::new(PoolState {
				idle:        VecDeque::new(),
				total:       0,
				checked_out: 0,
				generation:  0,
				next_id:     0,
				closing:     false,
				closed:      false
			}),
			available: Condvar::new(),
			drained:   Condvar::new()
		}))
	}

	pub fn address(&self) -> &ServerAddress {
		&self.0.address
	}

	/// Takes a connection out of the pool, creating one if the pool is below
	/// `max_pool_size`, otherwise blocking until one checks in or `timeout`
	/// expires.
	pub fn check_out(&self, timeout: Duration) -> Result<Connection> {
		let inner = &*self.0;
		inner.events.publish(Event::ConnectionCheckOutStarted { address: inner.address.clone() });

		let deadline = Instant::now() + timeout;
		let mut state = inner.state.lock()?;

		loop {
			if state.closing || state.closed {
				drop(state);
				inner.events.publish(Event::ConnectionCheckOutFailed {
					address: inner.address.clone(),
					reason:  ConnectionCheckOutFailedReason::PoolClosed
				});
				return Err(Error::PoolClosed(inner.address.clone()));
			}

			// events are published only after the state lock is released,
			// listeners may call back into the pool
			let mut events = Vec::new();

			// newest-first so idle expiry prunes from the cold end
			while let Some(idle) = state.idle.pop_back() {
				if idle.generation != state.generation {
					state.total -= 1;
					events.push(inner.close_idle(idle, ConnectionClosedReason::Stale));
					inner.available.notify_one();
				} else if !inner.options.max_idle_time.is_zero()
					&& idle.since.elapsed() > inner.options.max_idle_time
				{
					state.total -= 1;
					events.push(inner.close_idle(idle, ConnectionClosedReason::Idle));
					inner.available.notify_one();
				} else {
					state.checked_out += 1;
					let conn = Connection {
						id:         idle.id,
						generation: idle.generation,
						address:    inner.address.clone(),
						channel:    Some(idle.channel),
						pool:       Some(self.0.clone()),
						has_error:  false
					};
					inner.fill_to_min(&mut state, &mut events);
					drop(state);
					for event in events {
						inner.events.publish(event);
					}
					inner.events.publish(Event::ConnectionCheckedOut {
						address:       inner.address.clone(),
						connection_id: conn.id
					});
					return Ok(conn);
				}
			}

			if state.total < inner.options.max_pool_size {
				state.total += 1;
				state.next_id += 1;
				let id = state.next_id;
				let generation = state.generation;
				events.push(Event::ConnectionCreated {
					address:       inner.address.clone(),
					connection_id: id
				});

				match inner.transport.connect(&inner.address) {
					Ok(channel) => {
						state.checked_out += 1;
						inner.fill_to_min(&mut state, &mut events);
						drop(state);
						for event in events {
							inner.events.publish(event);
						}
						inner.events.publish(Event::ConnectionReady {
							address:       inner.address.clone(),
							connection_id: id
						});
						inner.events.publish(Event::ConnectionCheckedOut {
							address:       inner.address.clone(),
							connection_id: id
						});
						return Ok(Connection {
							id,
							generation,
							address:   inner.address.clone(),
							channel:   Some(channel),
							pool:      Some(self.0.clone()),
							has_error: false
						});
					}
					Err(e) => {
						state.total -= 1;
						inner.available.notify_one();
						drop(state);
						for event in events {
							inner.events.publish(event);
						}
						inner.events.publish(Event::ConnectionCheckOutFailed {
							address: inner.address.clone(),
							reason:  ConnectionCheckOutFailedReason::Error
						});
						return Err(e);
					}
				}
			}

			// flush prune events before blocking
			if !events.is_empty() {
				drop(state);
				for event in events {
					inner.events.publish(event);
				}
				state = inner.state.lock()?;
				continue;
			}

			let now = Instant::now();
			if now >= deadline {
				drop(state);
				inner.events.publish(Event::ConnectionCheckOutFailed {
					address: inner.address.clone(),
					reason:  ConnectionCheckOutFailedReason::Timeout
				});
				return Err(Error::PoolTimeout { address: inner.address.clone(), waited: timeout });
			}

			state = inner.available.wait_timeout(state, deadline - now)?.0;
		}
	}

	/// Invalidates the pool's current connections. Idle connections close
	/// immediately, checked-out ones keep working and close on check-in.
	pub fn clear(&self) {
		let inner = &*self.0;
		let mut state = match inner.state.lock() {
			Ok(state) => state,
			Err(_) => return
		};

		if state.closing || state.closed {
			return;
		}

		state.generation += 1;
		let generation = state.generation;

		let mut events = Vec::new();
		while let Some(idle) = state.idle.pop_front() {
			state.total -= 1;
			events.push(inner.close_idle(idle, ConnectionClosedReason::Stale));
		}

		inner.available.notify_all();
		drop(state);

		for event in events {
			inner.events.publish(event);
		}

		log::debug!("pool {} cleared, generation now {}", inner.address, generation);
		inner.events.publish(Event::PoolCleared { address: inner.address.clone(), generation });
	}

	/// Closes the pool and blocks until every outstanding connection has
	/// checked back in. Idempotent, concurrent callers all wait for the
	/// drain to complete.
	pub fn close(&self) {
		let inner = &*self.0;
		let mut state = match inner.state.lock() {
			Ok(state) => state,
			Err(_) => return
		};

		let mut events = Vec::new();

		if !state.closed && !state.closing {
			state.closing = true;

			while let Some(idle) = state.idle.pop_front() {
				state.total -= 1;
				events.push(inner.close_idle(idle, ConnectionClosedReason::PoolClosed));
			}

			// fail blocked checkouts fast
			inner.available.notify_all();

			if state.checked_out == 0 {
				state.closing = false;
				state.closed = true;
				inner.drained.notify_all();
				drop(state);
				for event in events {
					inner.events.publish(event);
				}
				inner.events.publish(Event::PoolClosed { address: inner.address.clone() });
				return;
			}
		}

		// flush idle closes before blocking on the drain
		if !events.is_empty() {
			drop(state);
			for event in events {
				inner.events.publish(event);
			}
			state = match inner.state.lock() {
				Ok(state) => state,
				Err(_) => return
			};
		}

		while !state.closed {
			state = match inner.drained.wait(state) {
				Ok(state) => state,
				Err(_) => return
			};
		}
	}

	pub fn is_closing(&self) -> bool {
		self.0.state.lock().map(|s| s.closing).unwrap_or(true)
	}

	pub fn is_closed(&self) -> bool {
		self.0.state.lock().map(|s| s.closed).unwrap_or(true)
	}

	pub fn generation(&self) -> u64 {
		self.0.state.lock().map(|s| s.generation).unwrap_or(0)
	}

	pub fn checked_out_count(&self) -> usize {
		self.0.state.lock().map(|s| s.checked_out).unwrap_or(0)
	}

	pub fn available_count(&self) -> usize {
		self.0.state.lock().map(|s| s.idle.len()).unwrap_or(0)
	}
}

impl PoolInner {
	/// Closes the channel and returns the event for the caller to publish
	/// once the state lock is released.
	fn close_idle(&self, mut idle: IdleConnection, reason: ConnectionClosedReason) -> Event {
		idle.channel.close();
		Event::ConnectionClosed {
			address:       self.address.clone(),
			connection_id: idle.id,
			reason
		}
	}

	/// Best-effort top-up to `min_pool_size`, connect failures are left to
	/// the monitor to notice.
	fn fill_to_min(&self, state: &mut PoolState, events: &mut Vec<Event>) {
		while state.total < self.options.min_pool_size && state.total < self.options.max_pool_size {
			state.total += 1;
			state.next_id += 1;
			let id = state.next_id;
			events.push(Event::ConnectionCreated {
				address:       self.address.clone(),
				connection_id: id
			});

			match self.transport.connect(&self.address) {
				Ok(channel) => {
					state.idle.push_back(IdleConnection {
						id,
						generation: state.generation,
						channel,
						since:      Instant::now()
					});
					self.available.notify_one();
					events.push(Event::ConnectionReady {
						address:       self.address.clone(),
						connection_id: id
					});
				}
				Err(e) => {
					state.total -= 1;
					events.push(Event::ConnectionClosed {
						address:       self.address.clone(),
						connection_id: id,
						reason:        ConnectionClosedReason::Error
					});
					log::debug!("pool {} min fill failed: {}", self.address, e);
					return;
				}
			}
		}
	}

	fn check_in(self: Arc<Self>, id: u64, generation: u64, mut channel: Box<dyn Channel>, has_error: bool) {
		let mut state = match self.state.lock() {
			Ok(state) => state,
			Err(_) => return
		};

		state.checked_out -= 1;

		let reason = if has_error {
			Some(ConnectionClosedReason::Error)
		} else if state.closing || state.closed {
			Some(ConnectionClosedReason::PoolClosed)
		} else if generation != state.generation {
			Some(ConnectionClosedReason::Stale)
		} else {
			None
		};

		let event = match reason {
			Some(reason) => {
				state.total -= 1;
				channel.close();
				Event::ConnectionClosed {
					address:       self.address.clone(),
					connection_id: id,
					reason
				}
			}
			None => {
				state.idle.push_back(IdleConnection {
					id,
					generation,
					channel,
					since: Instant::now()
				});
				Event::ConnectionCheckedIn {
					address:       self.address.clone(),
					connection_id: id
				}
			}
		};

		self.available.notify_one();

		let drained = state.closing && state.checked_out == 0;
		if drained {
			state.closing = false;
			state.closed = true;
			self.drained.notify_all();
		}
		drop(state);

		self.events.publish(event);
		if drained {
			self.events.publish(Event::PoolClosed { address: self.address.clone() });
		}
	}
}

/// A checked-out connection. Move-only, checking back in happens exactly once
/// when the handle drops.
pub struct Connection {
	id:         u64,
	generation: u64,
	address:    ServerAddress,
	channel:    Option<Box<dyn Channel>>,
	pool:       Option<Arc<PoolInner>>,
	has_error:  bool
}

impl Connection {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn address(&self) -> &ServerAddress {
		&self.address
	}

	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Sends one command over this connection. A transport failure poisons
	/// the handle, it will be closed instead of reused on check-in.
	pub fn round_trip(&mut self, request: &Document) -> Result<Document> {
		let channel = self.channel.as_mut().ok_or_else(|| Error::network("connection closed"))?;
		match channel.round_trip(request) {
			Err(e @ Error::Io(_)) => {
				self.has_error = true;
				Err(e)
			}
			other => other
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		if let (Some(pool), Some(channel)) = (self.pool.take(), self.channel.take()) {
			pool.check_in(self.id, self.generation, channel, self.has_error);
		}
	}
}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("id", &self.id)
			.field("address", &self.address)
			.field("generation", &self.generation)
			.finish()
	}
}
