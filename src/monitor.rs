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

//! Per-server heartbeat threads.
//!
//! Each monitored server gets one background thread that round-trips `hello`
//! on its own dedicated channel, publishes the resulting description into the
//! topology and sleeps until the next scheduled or requested check.

use {
	crate::{
		common::{Result, ServerAddress, GenericReply},
		doc,
		document::ObjectId,
		pool::ConnectionPool,
		topology::{ServerDescription, Topology, TopologyInner},
		transport::{Channel, Transport}
	},
	std::{
		collections::HashMap,
		sync::{Arc, Condvar, Mutex, Weak, atomic::{AtomicBool, Ordering}},
		time::{Duration, Instant}
	},
	serde::Deserialize
};

/// Checks never run closer together than this, even when requested.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelloReply {
	#[serde(alias = "ismaster")]
	pub is_writable_primary:             bool,
	pub msg:                             Option<String>,
	pub set_name:                        Option<String>,
	pub secondary:                       Option<bool>,
	pub arbiter_only:                    Option<bool>,
	pub isreplicaset:                    Option<bool>,
	pub hosts:                           Option<Vec<String>>,
	pub passives:                        Option<Vec<String>>,
	pub arbiters:                        Option<Vec<String>>,
	pub tags:                            Option<HashMap<String, String>>,
	pub me:                              Option<String>,
	pub primary:                         Option<String>,
	pub set_version:                     Option<i32>,
	pub election_id:                     Option<ObjectId>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub logical_session_timeout_minutes: Option<i32>,
	pub last_write:                      Option<LastWrite>,
	pub service_id:                      Option<ObjectId>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
	pub last_write_date: i64
}

/// Owns one monitor thread. Dropping the handle signals the thread to stop
/// without joining it, [`MonitorHandle::join`] waits for the exit.
pub(crate) struct MonitorHandle {
	shared: Arc<MonitorShared>,
	thread: Option<std::thread::JoinHandle<()>>
}

struct MonitorShared {
	stop:      AtomicBool,
	requested: Mutex<bool>,
	wake:      Condvar
}

impl MonitorHandle {
	pub fn spawn(
		address:             ServerAddress,
		pool:                ConnectionPool,
		topology:            Weak<TopologyInner>,
		transport:           Arc<dyn Transport>,
		heartbeat_frequency: Duration
	) -> Self {
		let shared = Arc::new(MonitorShared {
			stop:      AtomicBool::new(false),
			requested: Mutex::new(false),
			wake:      Condvar::new()
		});

		let thread = {
			let shared = shared.clone();
			std::thread::Builder::new()
				.name(format!("monitor-{}", address))
				.spawn(move || Monitor {
					address,
					pool,
					topology,
					transport,
					heartbeat_frequency,
					shared,
					channel: None,
					rtt:     None
				}.run())
				.ok()
		};

		Self { shared, thread }
	}

	/// Asks for an immediate check, subject to [`MIN_HEARTBEAT_INTERVAL`].
	pub fn request_check(&self) {
		if let Ok(mut requested) = self.shared.requested.lock() {
			*requested = true;
			self.shared.wake.notify_all();
		}
	}

	pub fn stop(&self) {
		self.shared.stop.store(true, Ordering::SeqCst);
		self.shared.wake.notify_all();
	}

	pub fn join(mut self) {
		self.stop();
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

impl Drop for MonitorHandle {
	fn drop(&mut self) {
		self.stop();
	}
}

struct Monitor {
	address:             ServerAddress,
	pool:                ConnectionPool,
	topology:            Weak<TopologyInner>,
	transport:           Arc<dyn Transport>,
	heartbeat_frequency: Duration,
	shared:              Arc<MonitorShared>,
	channel:             Option<Box<dyn Channel>>,
	rtt:                 Option<Duration>
}

impl Monitor {
	fn run(mut self) {
		log::debug!("monitor for {} started", self.address);

		loop {
			if self.shared.stop.load(Ordering::SeqCst) {
				break;
			}

			let topology = match self.topology.upgrade() {
				Some(inner) => Topology(inner),
				None => break
			};

			let round = topology.next_round();
			let started = Instant::now();
			let failed = match self.check() {
				Ok(reply) => {
					let rtt = self.update_rtt(started.elapsed());
					match ServerDescription::from_hello(self.address.clone(), &reply, rtt, round) {
						Ok(description) => {
							topology.apply(description);
							false
						}
						Err(e) => {
							self.fail(&topology, round, &e.to_string());
							true
						}
					}
				}
				Err(e) => {
					self.fail(&topology, round, &e.to_string());
					true
				}
			};

			drop(topology);

			if !self.sleep(started, failed) {
				break;
			}
		}

		log::debug!("monitor for {} stopped", self.address);
	}

	fn check(&mut self) -> Result<HelloReply> {
		if self.channel.is_none() {
			self.channel = Some(self.transport.connect(&self.address)?);
		}

		let reply = match self.channel.as_mut()
			.map(|channel| channel.round_trip(&doc! { "hello" => 1i32 }))
		{
			Some(Ok(reply)) => reply,
			Some(Err(e)) => {
				self.channel = None;
				return Err(e);
			}
			None => unreachable!()
		};

		let generic: GenericReply = reply.deserialize()?;
		if generic.ok != 1.0 {
			return Err(generic.into());
		}

		Ok(reply.deserialize()?)
	}

	fn fail(&mut self, topology: &Topology, round: u64, error: &str) {
		log::debug!("heartbeat to {} failed: {}", self.address, error);
		self.channel = None;
		self.rtt = None;
		self.pool.clear();
		topology.apply(ServerDescription::failed(self.address.clone(), error.to_string(), round));
	}

	fn update_rtt(&mut self, sample: Duration) -> Duration {
		let rtt = match self.rtt {
			// EWMA with alpha 0.2
			Some(previous) => previous.mul_f64(0.8) + sample.mul_f64(0.2),
			None           => sample
		};
		self.rtt = Some(rtt);
		rtt
	}

	/// Sleeps until the next check is due, an expedited check is requested,
	/// or the monitor is stopped. Returns `false` on stop.
	fn sleep(&self, last_check: Instant, failed: bool) -> bool {
		let mut guard = match self.shared.requested.lock() {
			Ok(guard) => guard,
			Err(_) => return false
		};

		loop {
			if self.shared.stop.load(Ordering::SeqCst) {
				return false;
			}

			let interval = if failed || *guard {
				MIN_HEARTBEAT_INTERVAL.min(self.heartbeat_frequency)
			} else {
				self.heartbeat_frequency
			};

			let elapsed = last_check.elapsed();
			if elapsed >= interval {
				*guard = false;
				return true;
			}

			guard = match self.shared.wake.wait_timeout(guard, interval - elapsed) {
				Ok((guard, _)) => guard,
				Err(_) => return false
			};
		}
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::{
			common::{ClientOptions, ReadPreference},
			apm::EventBus,
			topology::ServerType,
			transport::mock::{self, MockTransport}
		},
		std::str::FromStr
	};

	#[test]
	fn hello_reply_classification() {
		let reply: HelloReply = mock::hello_rs_primary("rs0", "a:27017", &["a:27017", "b:27017"])
			.deserialize().unwrap();
		assert!(reply.is_writable_primary);
		assert_eq!(reply.set_name.as_deref(), Some("rs0"));
		assert_eq!(reply.hosts.as_ref().map(Vec::len), Some(2));

		let address: ServerAddress = "a:27017".parse().unwrap();
		let description = ServerDescription::from_hello(
			address.clone(), &reply, Duration::from_millis(3), 1).unwrap();
		assert_eq!(description.server_type, ServerType::RSPrimary);
		assert_eq!(description.logical_session_timeout, Some(Duration::from_secs(1800)));

		let secondary: HelloReply = mock::hello_rs_secondary("rs0", "a:27017", &["a:27017"], Some("b:27017"))
			.deserialize().unwrap();
		let description = ServerDescription::from_hello(
			address.clone(), &secondary, Duration::from_millis(3), 1).unwrap();
		assert_eq!(description.server_type, ServerType::RSSecondary);
		assert_eq!(description.primary, Some("b:27017".parse().unwrap()));

		let mongos: HelloReply = crate::doc! {
			"ok"                => 1.0,
			"isWritablePrimary" => true,
			"msg"               => "isdbgrid",
			"maxWireVersion"    => 17i32
		}.deserialize().unwrap();
		let description = ServerDescription::from_hello(
			address, &mongos, Duration::from_millis(3), 1).unwrap();
		assert_eq!(description.server_type, ServerType::Mongos);
	}

	#[test]
	fn legacy_ismaster_field_is_accepted() {
		let reply: HelloReply = crate::doc! {
			"ok"             => 1.0,
			"ismaster"       => true,
			"setName"        => "rs0",
			"maxWireVersion" => 17i32
		}.deserialize().unwrap();
		assert!(reply.is_writable_primary);
	}

	#[test]
	fn unreachable_server_becomes_unknown_with_error() {
		let transport = MockTransport::new();
		let address: ServerAddress = "a:27017".parse().unwrap();
		transport.set(&address, mock::server(mock::hello_standalone()));

		let options = ClientOptions::from_str(
			"mongodb://a:27017/?heartbeatFrequencyMS=20&serverSelectionTimeoutMS=2000").unwrap();
		let topology = Topology::new(&options, transport.clone(), Arc::new(EventBus::new()));
		topology.select_server(&ReadPreference::default()).unwrap();

		transport.take_down(&address);

		let deadline = Instant::now() + Duration::from_secs(2);
		loop {
			let description = topology.description();
			let server = description.server(&address).unwrap();
			if server.server_type == ServerType::Unknown {
				assert!(server.error.is_some());
				break;
			}
			assert!(Instant::now() < deadline, "server never became unknown");
			std::thread::sleep(Duration::from_millis(5));
		}

		topology.close();
	}
}
