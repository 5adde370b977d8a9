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

//! Server discovery and monitoring.
//!
//! [`TopologyDescription`] is an immutable value, every heartbeat produces a
//! whole new description through [`TopologyDescription::with_server`] and the
//! coordinator swaps the `Arc` and wakes waiting selectors through a condvar.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst,
//! https://github.com/mongodb/specifications/blob/master/source/server-selection/server-selection.rst

use {
	crate::{
		apm::{Event, EventBus},
		common::{ClientOptions, Error, Result, ServerAddress, ServerSelectionConfig, ReadPreference,
			ReadPreferenceMode, ConnectionPoolOptions},
		document::ObjectId,
		monitor::{HelloReply, MonitorHandle},
		pool::ConnectionPool,
		transport::Transport
	},
	std::{
		collections::HashMap,
		sync::{Arc, Condvar, Mutex, atomic::{AtomicU64, Ordering}},
		time::{Duration, Instant, SystemTime}
	},
	rand::Rng
};

pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TopologyType {
	Unknown,
	Single,
	ReplicaSetNoPrimary,
	ReplicaSetWithPrimary,
	Sharded,
	LoadBalanced
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerType {
	Unknown,
	Standalone,
	Mongos,
	PossiblePrimary,
	RSPrimary,
	RSSecondary,
	RSArbiter,
	RSOther,
	RSGhost,
	LoadBalancer
}

impl ServerType {
	pub fn is_data_bearing(self) -> bool {
		matches!(self,
			Self::Standalone | Self::Mongos | Self::RSPrimary | Self::RSSecondary | Self::LoadBalancer)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#serverdescription
#[derive(Debug, Clone)]
pub struct ServerDescription {
	pub address:                 ServerAddress,
	pub server_type:             ServerType,
	pub round_trip_time:         Option<Duration>,
	/// The failure that made this server Unknown, if any.
	pub error:                   Option<String>,
	pub min_wire_version:        i32,
	pub max_wire_version:        i32,
	pub me:                      Option<ServerAddress>,
	pub hosts:                   Vec<ServerAddress>,
	pub passives:                Vec<ServerAddress>,
	pub arbiters:                Vec<ServerAddress>,
	pub tags:                    HashMap<String, String>,
	pub set_name:                Option<String>,
	pub set_version:             Option<i32>,
	pub election_id:             Option<ObjectId>,
	pub primary:                 Option<ServerAddress>,
	pub logical_session_timeout: Option<Duration>,
	/// Milliseconds since the epoch of the server's last write, for
	/// staleness estimates.
	pub last_write_date:         Option<i64>,
	pub last_update_time:        Option<SystemTime>,
	/// Monotonic check counter, heartbeat results older than what the
	/// topology already holds are discarded.
	pub(crate) round:            u64
}

impl ServerDescription {
	pub fn unknown(address: ServerAddress) -> Self {
		Self {
			address,
			server_type:             ServerType::Unknown,
			round_trip_time:         None,
			error:                   None,
			min_wire_version:        0,
			max_wire_version:        0,
			me:                      None,
			hosts:                   Vec::new(),
			passives:                Vec::new(),
			arbiters:                Vec::new(),
			tags:                    HashMap::new(),
			set_name:                None,
			set_version:             None,
			election_id:             None,
			primary:                 None,
			logical_session_timeout: None,
			last_write_date:         None,
			last_update_time:        None,
			round:                   0
		}
	}

	pub fn failed(address: ServerAddress, error: String, round: u64) -> Self {
		Self {
			error: Some(error),
			last_update_time: Some(SystemTime::now()),
			round,
			..Self::unknown(address)
		}
	}

	pub fn from_hello(address: ServerAddress, reply: &HelloReply, rtt: Duration, round: u64) -> Result<Self> {
		let server_type = match reply {
			HelloReply { msg: Some(msg), .. } if msg == "isdbgrid"            => ServerType::Mongos,
			HelloReply { set_name: Some(_), is_writable_primary: true, .. }   => ServerType::RSPrimary,
			HelloReply { set_name: Some(_), secondary: Some(true), .. }       => ServerType::RSSecondary,
			HelloReply { set_name: Some(_), arbiter_only: Some(true), .. }    => ServerType::RSArbiter,
			HelloReply { set_name: Some(_), .. }                              => ServerType::RSOther,
			HelloReply { isreplicaset: Some(true), .. }                       => ServerType::RSGhost,
			_                                                                 => ServerType::Standalone
		};

		let parse = |addresses: &Option<Vec<String>>| addresses.iter()
			.flatten()
			.map(|s| s.parse())
			.collect::<Result<Vec<ServerAddress>>>();

		Ok(Self {
			address,
			server_type,
			round_trip_time:         Some(rtt),
			error:                   None,
			min_wire_version:        reply.min_wire_version,
			max_wire_version:        reply.max_wire_version,
			me:                      reply.me.as_deref().map(str::parse).transpose()?,
			hosts:                   parse(&reply.hosts)?,
			passives:                parse(&reply.passives)?,
			arbiters:                parse(&reply.arbiters)?,
			tags:                    reply.tags.clone().unwrap_or_default(),
			set_name:                reply.set_name.clone(),
			set_version:             reply.set_version,
			election_id:             reply.election_id,
			primary:                 reply.primary.as_deref().map(str::parse).transpose()?,
			logical_session_timeout: reply.logical_session_timeout_minutes
				.map(|m| Duration::from_secs(m as u64 * 60)),
			last_write_date:         reply.last_write.as_ref().map(|w| w.last_write_date),
			last_update_time:        Some(SystemTime::now()),
			round
		})
	}

	/// Equality over the fields that drive SDAM transitions, ignoring
	/// round-trip time, timestamps and the check counter.
	pub fn topology_eq(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.server_type == other.server_type
			&& self.error == other.error
			&& self.min_wire_version == other.min_wire_version
			&& self.max_wire_version == other.max_wire_version
			&& self.me == other.me
			&& self.hosts == other.hosts
			&& self.passives == other.passives
			&& self.arbiters == other.arbiters
			&& self.tags == other.tags
			&& self.set_name == other.set_name
			&& self.set_version == other.set_version
			&& self.election_id == other.election_id
			&& self.primary == other.primary
			&& self.logical_session_timeout == other.logical_session_timeout
	}

	fn member_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
		self.hosts.iter().chain(&self.passives).chain(&self.arbiters)
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.rst#topologydescription
#[derive(Debug, Clone)]
pub struct TopologyDescription {
	pub topology_type:           TopologyType,
	pub set_name:                Option<String>,
	pub max_set_version:         Option<i32>,
	pub max_election_id:         Option<ObjectId>,
	pub compatibility_error:     Option<String>,
	/// The smallest logical session timeout across data-bearing servers,
	/// `None` when unknown or any server lacks one.
	pub logical_session_timeout: Option<Duration>,
	pub servers:                 HashMap<ServerAddress, ServerDescription>
}

impl TopologyDescription {
	pub fn new(options: &ClientOptions) -> Self {
		let mut self_ = Self {
			topology_type:           options.initial_topology_type(),
			set_name:                options.replica_set.clone(),
			max_set_version:         None,
			max_election_id:         None,
			compatibility_error:     None,
			logical_session_timeout: None,
			servers:                 options.hosts.iter()
				.map(|address| (address.clone(), ServerDescription::unknown(address.clone())))
				.collect()
		};

		// load balancers are not monitored, the single server is usable as-is
		if self_.topology_type == TopologyType::LoadBalanced {
			for server in self_.servers.values_mut() {
				server.server_type = ServerType::LoadBalancer;
			}
		}

		self_
	}

	pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
		self.servers.get(address)
	}

	pub fn has_primary(&self) -> bool {
		self.servers.values().any(|s| s.server_type == ServerType::RSPrimary)
	}

	/// Whether the deployment supports logical sessions, gating session use
	/// and the retry policy.
	pub fn supports_sessions(&self) -> bool {
		match self.topology_type {
			TopologyType::LoadBalanced => true,
			TopologyType::Unknown      => false,
			_ => self.logical_session_timeout.is_some()
		}
	}

	/// Folds one server's new description into a new topology description.
	/// Pure, `self` is left untouched.
	pub fn with_server(&self, description: ServerDescription) -> Self {
		let mut next = self.clone();
		let address = description.address.clone();

		if !next.servers.contains_key(&address) {
			return next;
		}

		let server_type = description.server_type;
		next.servers.insert(address.clone(), description);

		match (self.topology_type, server_type) {
			(TopologyType::Single, _)
			| (TopologyType::LoadBalanced, _)
			| (_, ServerType::PossiblePrimary)
			| (_, ServerType::LoadBalancer)
			| (TopologyType::Unknown, ServerType::Unknown)
			| (TopologyType::Unknown, ServerType::RSGhost)
			| (TopologyType::Sharded, ServerType::Unknown)
			| (TopologyType::Sharded, ServerType::Mongos)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSGhost) => (),

			(TopologyType::Sharded, _)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos) => {
				next.servers.remove(&address);
			}

			(TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos) => {
				next.servers.remove(&address);
				next.check_if_has_primary();
			}

			(TopologyType::Unknown, ServerType::Standalone) =>
				// a standalone among several seeds cannot be the deployment
				if self.servers.len() == 1 {
					next.topology_type = TopologyType::Single;
				} else {
					next.servers.remove(&address);
				}

			(TopologyType::Unknown, ServerType::Mongos) =>
				next.topology_type = TopologyType::Sharded,

			(TopologyType::Unknown, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSPrimary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSPrimary) =>
				next.update_rs_from_primary(&address),

			(TopologyType::Unknown, ServerType::RSSecondary)
			| (TopologyType::Unknown, ServerType::RSArbiter)
			| (TopologyType::Unknown, ServerType::RSOther)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetNoPrimary, ServerType::RSOther) =>
				next.update_rs_without_primary(&address),

			(TopologyType::ReplicaSetWithPrimary, ServerType::RSSecondary)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSArbiter)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSOther) =>
				next.update_rs_with_primary_from_member(&address),

			(TopologyType::ReplicaSetWithPrimary, ServerType::Unknown)
			| (TopologyType::ReplicaSetWithPrimary, ServerType::RSGhost) =>
				next.check_if_has_primary()
		}

		next.recompute();
		next
	}

	/// updateRSFromPrimary
	fn update_rs_from_primary(&mut self, address: &ServerAddress) {
		self.topology_type = TopologyType::ReplicaSetWithPrimary;
		let description = self.servers[address].clone();

		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		} else if self.set_name != description.set_name {
			self.servers.remove(address);
			self.check_if_has_primary();
			return;
		}

		if let (Some(set_version), Some(election_id)) = (description.set_version, description.election_id) {
			if let (Some(max_set_version), Some(max_election_id)) = (self.max_set_version, self.max_election_id) {
				if max_set_version > set_version
					|| (max_set_version == set_version && max_election_id > election_id)
				{
					// stale claim from a deposed primary
					let mut unknown = ServerDescription::unknown(address.clone());
					unknown.round = description.round;
					self.servers.insert(address.clone(), unknown);
					self.check_if_has_primary();
					return;
				}
			}
			self.max_election_id = Some(election_id);
		}

		match (description.set_version, self.max_set_version) {
			(Some(v), Some(max)) if v > max => self.max_set_version = Some(v),
			(Some(v), None)                 => self.max_set_version = Some(v),
			_ => ()
		}

		// demote any other primary

		for server in self.servers.values_mut() {
			if server.server_type == ServerType::RSPrimary && server.address != *address {
				let round = server.round;
				*server = ServerDescription::unknown(server.address.clone());
				server.round = round;
			}
		}

		// fold membership

		self.servers.retain(|a, _| a == address
			|| description.member_addresses().any(|m| m == a));

		for member in description.member_addresses() {
			if !self.servers.contains_key(member) {
				self.servers.insert(member.clone(), ServerDescription::unknown(member.clone()));
			}
		}

		if !description.member_addresses().any(|m| m == address) {
			self.servers.remove(address);
		}

		self.check_if_has_primary();
	}

	/// updateRSWithoutPrimary
	fn update_rs_without_primary(&mut self, address: &ServerAddress) {
		self.topology_type = TopologyType::ReplicaSetNoPrimary;
		let description = self.servers[address].clone();

		if self.set_name.is_none() {
			self.set_name = description.set_name.clone();
		} else if self.set_name != description.set_name {
			self.servers.remove(address);
			return;
		}

		for member in description.member_addresses() {
			if !self.servers.contains_key(member) {
				self.servers.insert(member.clone(), ServerDescription::unknown(member.clone()));
			}
		}

		self.mark_possible_primary(&description);

		if matches!(&description.me, Some(me) if me != address) {
			self.servers.remove(address);
		}
	}

	/// updateRSWithPrimaryFromMember
	fn update_rs_with_primary_from_member(&mut self, address: &ServerAddress) {
		let description = self.servers[address].clone();

		if self.set_name != description.set_name
			|| matches!(&description.me, Some(me) if me != address)
		{
			self.servers.remove(address);
			self.check_if_has_primary();
			return;
		}

		self.check_if_has_primary();
		self.mark_possible_primary(&description);
	}

	fn mark_possible_primary(&mut self, description: &ServerDescription) {
		if let Some(server) = description.primary.as_ref()
			.and_then(|primary| self.servers.get_mut(primary))
			.filter(|server| server.server_type == ServerType::Unknown)
		{
			server.server_type = ServerType::PossiblePrimary;
		}
	}

	fn check_if_has_primary(&mut self) {
		if self.topology_type == TopologyType::ReplicaSetWithPrimary && !self.has_primary() {
			self.topology_type = TopologyType::ReplicaSetNoPrimary;
		}
	}

	fn recompute(&mut self) {
		self.compatibility_error = self.servers.values()
			.filter(|s| s.server_type != ServerType::Unknown && s.server_type != ServerType::PossiblePrimary)
			.find_map(|s| if s.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
				Some(format!("server {} requires wire version {}, at most {} is supported",
					s.address, s.min_wire_version, MAX_SUPPORTED_WIRE_VERSION))
			} else if s.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
				Some(format!("server {} supports up to wire version {}, at least {} is required",
					s.address, s.max_wire_version, MIN_SUPPORTED_WIRE_VERSION))
			} else {
				None
			});

		self.logical_session_timeout = self.servers.values()
			.filter(|s| s.server_type.is_data_bearing())
			.map(|s| s.logical_session_timeout)
			.try_fold(None, |min: Option<Duration>, timeout| Some(match (min, timeout?) {
				(Some(min), t) => Some(min.min(t)),
				(None, t)      => Some(t)
			}))
			.flatten();
	}

	/// Equality over everything the SDAM change events care about.
	pub fn topology_eq(&self, other: &Self) -> bool {
		self.topology_type == other.topology_type
			&& self.set_name == other.set_name
			&& self.compatibility_error == other.compatibility_error
			&& self.logical_session_timeout == other.logical_session_timeout
			&& self.servers.len() == other.servers.len()
			&& self.servers.iter().all(|(a, s)| other.servers.get(a)
				.map(|o| s.topology_eq(o))
				.unwrap_or(false))
	}

	/// All servers eligible under `read_preference`, narrowed to the latency
	/// window. The caller picks one uniformly at random.
	pub fn select_candidates(
		&self,
		read_preference: &ReadPreference,
		config:          &ServerSelectionConfig
	) -> Vec<&ServerDescription> {
		let candidates: Vec<&ServerDescription> = match self.topology_type {
			TopologyType::Unknown => Vec::new(),
			TopologyType::Single => self.servers.values()
				.filter(|s| s.server_type != ServerType::Unknown
					&& s.server_type != ServerType::PossiblePrimary)
				.collect(),
			TopologyType::LoadBalanced => self.servers.values()
				.filter(|s| s.server_type == ServerType::LoadBalancer)
				.collect(),
			TopologyType::Sharded => self.servers.values()
				.filter(|s| s.server_type == ServerType::Mongos)
				.collect(),
			TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary =>
				match read_preference.mode {
					ReadPreferenceMode::Primary => self.primaries(),
					ReadPreferenceMode::Secondary => self.eligible_secondaries(read_preference, config),
					ReadPreferenceMode::PrimaryPreferred => {
						let primaries = self.primaries();
						if primaries.is_empty() {
							self.eligible_secondaries(read_preference, config)
						} else {
							primaries
						}
					}
					ReadPreferenceMode::SecondaryPreferred => {
						let secondaries = self.eligible_secondaries(read_preference, config);
						if secondaries.is_empty() {
							self.primaries()
						} else {
							secondaries
						}
					}
					ReadPreferenceMode::Nearest => self.primaries().into_iter()
						.chain(self.eligible_secondaries(read_preference, config))
						.collect()
				}
		};

		// latency window over the fastest candidate

		let fastest = candidates.iter()
			.filter_map(|s| s.round_trip_time)
			.min();

		match fastest {
			None => candidates,
			Some(fastest) => candidates.into_iter()
				.filter(|s| match s.round_trip_time {
					Some(rtt) => rtt <= fastest + config.local_threshold,
					None      => true
				})
				.collect()
		}
	}

	fn primaries(&self) -> Vec<&ServerDescription> {
		self.servers.values()
			.filter(|s| s.server_type == ServerType::RSPrimary)
			.collect()
	}

	fn eligible_secondaries(
		&self,
		read_preference: &ReadPreference,
		config:          &ServerSelectionConfig
	) -> Vec<&ServerDescription> {
		self.servers.values()
			.filter(|s| s.server_type == ServerType::RSSecondary)
			.filter(|s| match read_preference.max_staleness_seconds {
				Some(max) => self.staleness(s, config)
					.map(|staleness| staleness <= Duration::from_secs(max as u64))
					.unwrap_or(true),
				None => true
			})
			.filter(|s| read_preference.tag_sets.is_empty()
				|| read_preference.tag_sets.iter().any(|tags| tags.iter()
					.all(|(k, v)| s.tags.get(k) == Some(v))))
			.collect()
	}

	/// Estimated replication lag of a secondary.
	fn staleness(&self, secondary: &ServerDescription, config: &ServerSelectionConfig) -> Option<Duration> {
		let s_write = secondary.last_write_date?;

		let lag_millis = match self.servers.values()
			.find(|s| s.server_type == ServerType::RSPrimary)
		{
			Some(primary) => {
				let p_write = primary.last_write_date?;
				let s_update = secondary.last_update_time?.duration_since(SystemTime::UNIX_EPOCH).ok()?;
				let p_update = primary.last_update_time?.duration_since(SystemTime::UNIX_EPOCH).ok()?;
				(s_update.as_millis() as i64 - s_write) - (p_update.as_millis() as i64 - p_write)
			}
			None => self.servers.values()
				.filter(|s| s.server_type == ServerType::RSSecondary)
				.filter_map(|s| s.last_write_date)
				.max()? - s_write
		};

		Some(Duration::from_millis(lag_millis.max(0) as u64)
			+ config.heartbeat_frequency)
	}
}

/// The topology coordinator: owns the current description, the per-server
/// pools and monitors, and the condvar selectors wait on.
#[derive(Clone)]
pub struct Topology(pub(crate) Arc<TopologyInner>);

pub(crate) struct TopologyInner {
	pub(crate) id:        ObjectId,
	config:               ServerSelectionConfig,
	pool_options:         ConnectionPoolOptions,
	load_balanced:        bool,
	transport:            Arc<dyn Transport>,
	events:               Arc<EventBus>,
	state:                Mutex<TopologyState>,
	/// Signaled on every description change and on close.
	changed:              Condvar,
	round:                AtomicU64
}

struct TopologyState {
	description: Arc<TopologyDescription>,
	servers:     HashMap<ServerAddress, ServerHandle>,
	closed:      bool
}

struct ServerHandle {
	pool:    ConnectionPool,
	monitor: Option<MonitorHandle>
}

impl Topology {
	pub fn new(options: &ClientOptions, transport: Arc<dyn Transport>, events: Arc<EventBus>) -> Self {
		let id = ObjectId::new();
		events.publish(Event::TopologyOpening { topology_id: id });

		let description = Arc::new(TopologyDescription::new(options));
		let self_ = Self(Arc::new(TopologyInner {
			id,
			config:        options.server_selection_config,
			pool_options:  options.pool_options,
			load_balanced: options.load_balanced,
			transport,
			events,
			state: Mutex::new(TopologyState {
				description: description.clone(),
				servers:     HashMap::new(),
				closed:      false
			}),
			changed: Condvar::new(),
			round:   AtomicU64::new(1)
		}));

		if let Ok(mut state) = self_.0.state.lock() {
			for address in description.servers.keys() {
				let handle = self_.open_server(address);
				state.servers.insert(address.clone(), handle);
			}
		}

		self_
	}

	pub fn id(&self) -> ObjectId {
		self.0.id
	}

	pub fn description(&self) -> Arc<TopologyDescription> {
		self.0.state.lock()
			.map(|s| s.description.clone())
			.unwrap_or_else(|e| e.into_inner().description.clone())
	}

	pub(crate) fn next_round(&self) -> u64 {
		self.0.round.fetch_add(1, Ordering::SeqCst)
	}

	pub(crate) fn pool(&self, address: &ServerAddress) -> Option<ConnectionPool> {
		self.0.state.lock().ok()?.servers.get(address).map(|h| h.pool.clone())
	}

	fn open_server(&self, address: &ServerAddress) -> ServerHandle {
		self.0.events.publish(Event::ServerOpening {
			topology_id: self.0.id,
			address:     address.clone()
		});

		let pool = ConnectionPool::new(
			address.clone(),
			self.0.pool_options,
			self.0.transport.clone(),
			self.0.events.clone()
		);

		let monitor = if self.0.load_balanced {
			None
		} else {
			Some(MonitorHandle::spawn(
				address.clone(),
				pool.clone(),
				Arc::downgrade(&self.0),
				self.0.transport.clone(),
				self.0.config.heartbeat_frequency
			))
		};

		ServerHandle { pool, monitor }
	}

	/// Folds a monitor's (or error handler's) new server description into the
	/// topology, spawning and retiring servers as membership changes, and
	/// publishes the resulting change events.
	pub(crate) fn apply(&self, description: ServerDescription) {
		let inner = &*self.0;
		let mut events = Vec::new();
		let mut retired = Vec::new();

		{
			let mut state = match inner.state.lock() {
				Ok(state) => state,
				Err(_) => return
			};

			if state.closed {
				return;
			}

			let previous = match state.description.server(&description.address) {
				Some(previous) => previous.clone(),
				// not a member anymore
				None => return
			};

			// a result from before the server was last reset is stale
			if description.round < previous.round {
				return;
			}

			let next = Arc::new(state.description.with_server(description.clone()));

			for address in next.servers.keys() {
				if !state.servers.contains_key(address) {
					let handle = self.open_server(address);
					state.servers.insert(address.clone(), handle);
				}
			}

			let gone: Vec<ServerAddress> = state.servers.keys()
				.filter(|a| !next.servers.contains_key(a))
				.cloned()
				.collect();
			for address in gone {
				if let Some(handle) = state.servers.remove(&address) {
					retired.push((address, handle));
				}
			}

			if let Some(new) = next.server(&description.address) {
				if !previous.topology_eq(new) {
					events.push(Event::ServerDescriptionChanged {
						topology_id: inner.id,
						address:     description.address.clone(),
						previous:    Box::new(previous),
						new:         Box::new(new.clone())
					});
				}
			}

			if !state.description.topology_eq(&next) {
				events.push(Event::TopologyDescriptionChanged {
					topology_id: inner.id,
					previous:    state.description.clone(),
					new:         next.clone()
				});
			}

			state.description = next;
			inner.changed.notify_all();
		}

		for event in events {
			inner.events.publish(event);
		}

		for (address, handle) in retired {
			if let Some(monitor) = handle.monitor {
				// signal only, the monitor thread may be the caller
				monitor.stop();
			}
			let pool = handle.pool;
			let events = inner.events.clone();
			let topology_id = inner.id;
			std::thread::spawn(move || {
				pool.close();
				events.publish(Event::ServerClosed { topology_id, address });
			});
		}
	}

	/// Picks a server matching `read_preference`, waiting for the topology
	/// to change while no candidate exists.
	pub fn select_server(&self, read_preference: &ReadPreference) -> Result<(ServerAddress, ConnectionPool)> {
		let inner = &*self.0;
		let deadline = Instant::now() + inner.config.server_selection_timeout;
		let mut state = inner.state.lock()?;

		loop {
			if state.closed {
				return Err(Error::ClientClosed);
			}

			if let Some(error) = &state.description.compatibility_error {
				return Err(Error::ServerSelectionTimeout(error.clone()));
			}

			let address = {
				let candidates = state.description.select_candidates(read_preference, &inner.config);
				match candidates.len() {
					0 => None,
					n => Some(candidates[rand::thread_rng().gen_range(0, n)].address.clone())
				}
			};

			if let Some(address) = address {
				let pool = state.servers.get(&address)
					.map(|h| h.pool.clone())
					.ok_or_else(|| Error::ServerSelectionTimeout(
						format!("server {} disappeared during selection", address)))?;
				return Ok((address, pool));
			}

			// nothing eligible yet, expedite the monitors and wait

			for handle in state.servers.values() {
				if let Some(monitor) = &handle.monitor {
					monitor.request_check();
				}
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(Error::ServerSelectionTimeout(format!(
					"no server matching {:?} found within {:?}, topology: {:?}",
					read_preference.mode,
					inner.config.server_selection_timeout,
					state.description.topology_type
				)));
			}

			state = inner.changed.wait_timeout(state, deadline - now)?.0;
		}
	}

	/// Reacts to an application-operation failure: invalidating errors clear
	/// the server's pool, mark it Unknown and expedite its next heartbeat.
	pub(crate) fn handle_application_error(&self, address: &ServerAddress, error: &Error) {
		if !error.invalidates_server() {
			return;
		}

		log::debug!("marking {} unknown after: {}", address, error);

		let (pool, monitor_woken) = {
			let state = match self.0.state.lock() {
				Ok(state) => state,
				Err(_) => return
			};
			match state.servers.get(address) {
				Some(handle) => {
					if let Some(monitor) = &handle.monitor {
						monitor.request_check();
					}
					(Some(handle.pool.clone()), true)
				}
				None => (None, false)
			}
		};

		if let Some(pool) = pool {
			pool.clear();
		}

		// load balancers have no monitor to rediscover them, the server
		// stays selectable and only its pool is reset
		if monitor_woken && !self.0.load_balanced {
			self.apply(ServerDescription::failed(
				address.clone(),
				error.to_string(),
				self.next_round()
			));
		}
	}

	/// Shuts down every monitor and pool. Idempotent, blocks until pools
	/// have drained.
	pub fn close(&self) {
		let inner = &*self.0;
		let handles = {
			let mut state = match inner.state.lock() {
				Ok(state) => state,
				Err(_) => return
			};

			if state.closed {
				return;
			}

			state.closed = true;
			inner.changed.notify_all();
			state.servers.drain().collect::<Vec<_>>()
		};

		for (_, handle) in &handles {
			if let Some(monitor) = &handle.monitor {
				monitor.stop();
			}
		}

		for (address, mut handle) in handles {
			if let Some(monitor) = handle.monitor.take() {
				monitor.join();
			}
			handle.pool.close();
			inner.events.publish(Event::ServerClosed {
				topology_id: inner.id,
				address
			});
		}

		inner.events.publish(Event::TopologyClosed { topology_id: inner.id });
	}
}

#[cfg(test)]
mod tests {
	use {
		super::*,
		crate::transport::mock::{self, MockTransport},
		std::sync::Mutex
	};

	fn addr(s: &str) -> ServerAddress {
		s.parse().unwrap()
	}

	fn options(uri: &str) -> ClientOptions {
		uri.parse().unwrap()
	}

	fn rs_member(address: &str, server_type: ServerType, hosts: &[&str]) -> ServerDescription {
		ServerDescription {
			server_type,
			set_name:                Some("rs0".to_string()),
			me:                      Some(addr(address)),
			hosts:                   hosts.iter().map(|h| addr(h)).collect(),
			min_wire_version:        6,
			max_wire_version:        17,
			logical_session_timeout: Some(Duration::from_secs(1800)),
			round_trip_time:         Some(Duration::from_millis(5)),
			round:                   1,
			..ServerDescription::unknown(addr(address))
		}
	}

	#[test]
	fn unknown_to_single() {
		let description = TopologyDescription::new(&options("mongodb://a:27017"));
		assert_eq!(description.topology_type, TopologyType::Unknown);

		let next = description.with_server(ServerDescription {
			server_type:             ServerType::Standalone,
			min_wire_version:        6,
			max_wire_version:        17,
			logical_session_timeout: Some(Duration::from_secs(1800)),
			round:                   1,
			..ServerDescription::unknown(addr("a:27017"))
		});

		assert_eq!(next.topology_type, TopologyType::Single);
		assert!(next.supports_sessions());
		assert!(next.compatibility_error.is_none());
	}

	#[test]
	fn standalone_removed_from_multi_seed_unknown() {
		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017"));
		let next = description.with_server(ServerDescription {
			server_type: ServerType::Standalone,
			round:       1,
			..ServerDescription::unknown(addr("a:27017"))
		});

		assert_eq!(next.topology_type, TopologyType::Unknown);
		assert!(!next.servers.contains_key(&addr("a:27017")));
	}

	#[test]
	fn primary_discovery_folds_membership() {
		let description = TopologyDescription::new(&options("mongodb://a:27017/?replicaSet=rs0"));
		assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary);

		let next = description.with_server(
			rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017", "c:27017"]));

		assert_eq!(next.topology_type, TopologyType::ReplicaSetWithPrimary);
		assert_eq!(next.servers.len(), 3);
		assert!(next.servers.contains_key(&addr("b:27017")));
		assert_eq!(next.servers[&addr("b:27017")].server_type, ServerType::Unknown);
	}

	#[test]
	fn at_most_one_primary() {
		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017/?replicaSet=rs0"))
			.with_server(rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017"]));

		// b also claims to be primary, a gets demoted
		let next = description.with_server(
			rs_member("b:27017", ServerType::RSPrimary, &["a:27017", "b:27017"]));

		let primaries = next.servers.values()
			.filter(|s| s.server_type == ServerType::RSPrimary)
			.count();
		assert_eq!(primaries, 1);
		assert_eq!(next.servers[&addr("b:27017")].server_type, ServerType::RSPrimary);
		assert_eq!(next.servers[&addr("a:27017")].server_type, ServerType::Unknown);
	}

	#[test]
	fn stale_primary_claim_is_discarded() {
		let election_1 = ObjectId([1; 12]);
		let election_2 = ObjectId([2; 12]);

		let mut fresh = rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017"]);
		fresh.set_version = Some(1);
		fresh.election_id = Some(election_2);

		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017/?replicaSet=rs0"))
			.with_server(fresh);

		let mut stale = rs_member("b:27017", ServerType::RSPrimary, &["a:27017", "b:27017"]);
		stale.set_version = Some(1);
		stale.election_id = Some(election_1);

		let next = description.with_server(stale);
		assert_eq!(next.servers[&addr("b:27017")].server_type, ServerType::Unknown);
		assert_eq!(next.servers[&addr("a:27017")].server_type, ServerType::RSPrimary);
		assert_eq!(next.topology_type, TopologyType::ReplicaSetWithPrimary);
	}

	#[test]
	fn set_name_mismatch_removes_server() {
		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017/?replicaSet=rs0"));

		let mut intruder = rs_member("b:27017", ServerType::RSSecondary, &["b:27017"]);
		intruder.set_name = Some("other".to_string());

		let next = description.with_server(intruder);
		assert!(!next.servers.contains_key(&addr("b:27017")));
		assert_eq!(next.set_name.as_deref(), Some("rs0"));
	}

	#[test]
	fn secondary_marks_possible_primary() {
		let mut secondary = rs_member("a:27017", ServerType::RSSecondary, &["a:27017", "b:27017"]);
		secondary.primary = Some(addr("b:27017"));

		let next = TopologyDescription::new(&options("mongodb://a:27017,b:27017/?replicaSet=rs0"))
			.with_server(secondary);

		assert_eq!(next.topology_type, TopologyType::ReplicaSetNoPrimary);
		assert_eq!(next.servers[&addr("b:27017")].server_type, ServerType::PossiblePrimary);
	}

	#[test]
	fn primary_demotion_loses_primary_type() {
		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017/?replicaSet=rs0"))
			.with_server(rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017"]));
		assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);

		let next = description.with_server(ServerDescription {
			error: Some("connection refused".to_string()),
			round: 2,
			..ServerDescription::unknown(addr("a:27017"))
		});

		assert_eq!(next.topology_type, TopologyType::ReplicaSetNoPrimary);
	}

	#[test]
	fn wire_version_incompatibility_is_reported() {
		let mut ancient = rs_member("a:27017", ServerType::RSPrimary, &["a:27017"]);
		ancient.max_wire_version = 2;

		let next = TopologyDescription::new(&options("mongodb://a:27017/?replicaSet=rs0"))
			.with_server(ancient);
		assert!(next.compatibility_error.is_some());
	}

	#[test]
	fn secondary_selection_never_returns_primary() {
		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017,c:27017/?replicaSet=rs0"))
			.with_server(rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017", "c:27017"]))
			.with_server(rs_member("b:27017", ServerType::RSSecondary, &["a:27017", "b:27017", "c:27017"]))
			.with_server(rs_member("c:27017", ServerType::RSSecondary, &["a:27017", "b:27017", "c:27017"]));

		let config = ServerSelectionConfig::default();

		for _ in 0..20 {
			let candidates = description.select_candidates(&ReadPreference::secondary(), &config);
			assert!(!candidates.is_empty());
			assert!(candidates.iter().all(|s| s.server_type == ServerType::RSSecondary));
		}

		let primaries = description.select_candidates(&ReadPreference::default(), &config);
		assert_eq!(primaries.len(), 1);
		assert_eq!(primaries[0].address, addr("a:27017"));
	}

	#[test]
	fn tag_sets_filter_secondaries() {
		let mut east = rs_member("b:27017", ServerType::RSSecondary, &["a:27017", "b:27017", "c:27017"]);
		east.tags.insert("dc".to_string(), "east".to_string());
		let mut west = rs_member("c:27017", ServerType::RSSecondary, &["a:27017", "b:27017", "c:27017"]);
		west.tags.insert("dc".to_string(), "west".to_string());

		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017,c:27017/?replicaSet=rs0"))
			.with_server(rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017", "c:27017"]))
			.with_server(east)
			.with_server(west);

		let mut read_preference = ReadPreference::secondary();
		read_preference.tag_sets.push([("dc".to_string(), "west".to_string())].iter().cloned().collect());

		let candidates = description.select_candidates(&read_preference, &ServerSelectionConfig::default());
		assert_eq!(candidates.len(), 1);
		assert_eq!(candidates[0].address, addr("c:27017"));
	}

	#[test]
	fn latency_window_excludes_slow_servers() {
		let mut slow = rs_member("c:27017", ServerType::RSSecondary, &["a:27017", "b:27017", "c:27017"]);
		slow.round_trip_time = Some(Duration::from_millis(200));

		let description = TopologyDescription::new(&options("mongodb://a:27017,b:27017,c:27017/?replicaSet=rs0"))
			.with_server(rs_member("a:27017", ServerType::RSPrimary, &["a:27017", "b:27017", "c:27017"]))
			.with_server(rs_member("b:27017", ServerType::RSSecondary, &["a:27017", "b:27017", "c:27017"]))
			.with_server(slow);

		let candidates = description.select_candidates(
			&ReadPreference::secondary(), &ServerSelectionConfig::default());
		assert_eq!(candidates.len(), 1);
		assert_eq!(candidates[0].address, addr("b:27017"));
	}

	#[test]
	fn discovers_standalone_and_emits_single_change_event() {
		let transport = MockTransport::new();
		let address = addr("a:27017");
		transport.set(&address, mock::server(mock::hello_standalone()));

		let events = Arc::new(EventBus::new());
		let changes = Arc::new(Mutex::new(Vec::new()));
		{
			let changes = changes.clone();
			events.subscribe(Arc::new(move |event| {
				if let Event::TopologyDescriptionChanged { previous, new, .. } = event {
					changes.lock().unwrap().push((previous.topology_type, new.topology_type));
				}
			}));
		}

		let options = options("mongodb://a:27017/?heartbeatFrequencyMS=20&serverSelectionTimeoutMS=2000");
		options.validate().unwrap();

		let topology = Topology::new(&options, transport, events);
		let (selected, _) = topology.select_server(&ReadPreference::default()).unwrap();
		assert_eq!(selected, address);

		// let a few more heartbeats land, equal descriptions must not re-fire
		std::thread::sleep(Duration::from_millis(100));

		let changes = changes.lock().unwrap().clone();
		assert_eq!(changes, vec![(TopologyType::Unknown, TopologyType::Single)]);

		topology.close();
	}

	#[test]
	fn selection_times_out_on_unreachable_server() {
		let transport = MockTransport::new();
		let options = options("mongodb://down:27017/?serverSelectionTimeoutMS=50&heartbeatFrequencyMS=20");

		let topology = Topology::new(&options, transport, Arc::new(EventBus::new()));
		assert!(matches!(
			topology.select_server(&ReadPreference::default()),
			Err(Error::ServerSelectionTimeout(_))));
		topology.close();
	}

	#[test]
	fn application_error_marks_server_unknown_and_clears_pool() {
		let transport = MockTransport::new();
		let address = addr("a:27017");
		transport.set(&address, mock::server(mock::hello_standalone()));

		let options = options("mongodb://a:27017/?heartbeatFrequencyMS=10000&serverSelectionTimeoutMS=2000");
		let topology = Topology::new(&options, transport, Arc::new(EventBus::new()));

		let (_, pool) = topology.select_server(&ReadPreference::default()).unwrap();
		let generation = pool.generation();

		topology.handle_application_error(&address, &Error::network("reset by peer"));

		assert_eq!(pool.generation(), generation + 1);
		assert_eq!(
			topology.description().server(&address).unwrap().server_type,
			ServerType::Unknown);

		topology.close();
	}

	#[test]
	fn stale_heartbeat_round_is_discarded() {
		let transport = MockTransport::new();
		let address = addr("a:27017");
		transport.set(&address, mock::server(mock::hello_standalone()));

		let options = options("mongodb://a:27017/?heartbeatFrequencyMS=10000&serverSelectionTimeoutMS=2000");
		let topology = Topology::new(&options, transport, Arc::new(EventBus::new()));
		topology.select_server(&ReadPreference::default()).unwrap();

		let fresh = topology.next_round();
		topology.apply(ServerDescription::failed(address.clone(), "boom".to_string(), fresh));
		assert_eq!(topology.description().server(&address).unwrap().server_type, ServerType::Unknown);

		// a check that started before the failure reports back too late
		let stale = ServerDescription {
			server_type: ServerType::Standalone,
			round:       fresh - 1,
			..ServerDescription::unknown(address.clone())
		};
		topology.apply(stale);
		assert_eq!(topology.description().server(&address).unwrap().server_type, ServerType::Unknown);

		topology.close();
	}
}
