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

use {
	crate::{document, topology::TopologyType},
	std::{collections::HashMap, fmt, str::FromStr, time::Duration},
	serde::{Serialize, Deserialize}
};

pub const DEFAULT_PORT:                     u16      = 27017;
pub const DEFAULT_MIN_POOL_SIZE:            usize    = 0;
pub const DEFAULT_MAX_POOL_SIZE:            usize    = 100;
pub const DEFAULT_MAX_IDLE_TIME:            Duration = Duration::from_secs(0);
pub const DEFAULT_WAIT_QUEUE_TIMEOUT:       Duration = Duration::from_secs(10);
pub const DEFAULT_LOCAL_THRESHOLD:          Duration = Duration::from_millis(15);
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_FREQUENCY:      Duration = Duration::from_secs(10);
pub const MAX_POOL_SIZE_CEILING:            usize    = i32::max_value() as usize;
pub const MIN_MAX_STALENESS_SECONDS:        i64      = 90;

/// The address of a single server, normalized to a lowercase host name.
/// Used as the key of the topology's server map.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerAddress {
	pub host: String,
	pub port: u16
}

impl ServerAddress {
	pub fn new(host: &str, port: u16) -> Self {
		Self { host: host.to_ascii_lowercase(), port }
	}
}

impl fmt::Display for ServerAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

impl FromStr for ServerAddress {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let (host, port) = match s.find(':') {
			Some(i) => (&s[..i], s[i + 1..].parse().map_err(|_|
				Error::InvalidArgument(format!("invalid port in server address `{}`", s)))?),
			None => (s, DEFAULT_PORT)
		};

		if host.is_empty() {
			return Err(Error::InvalidArgument(format!("empty host in server address `{}`", s)));
		}

		Ok(Self::new(host, port))
	}
}

/// see https://github.com/mongodb/specifications/blob/master/source/connection-string/connection-string-spec.rst,
/// https://github.com/mongodb/specifications/blob/master/source/uri-options/uri-options.rst
#[derive(Debug, Clone)]
pub struct ClientOptions {
	pub hosts:                   Vec<ServerAddress>,
	pub appname:                 Option<String>,
	pub replica_set:             Option<String>,
	pub direct_connection:       bool,
	pub load_balanced:           bool,
	pub retry_reads:             bool,
	pub retry_writes:            bool,
	pub server_selection_config: ServerSelectionConfig,
	pub pool_options:            ConnectionPoolOptions,
	pub read_preference:         ReadPreference,
	pub read_concern:            Option<ReadConcern>,
	pub write_concern:           Option<WriteConcern>
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			hosts:                   Vec::new(),
			appname:                 None,
			replica_set:             None,
			direct_connection:       false,
			load_balanced:           false,
			retry_reads:             true,
			retry_writes:            true,
			server_selection_config: ServerSelectionConfig::default(),
			pool_options:            ConnectionPoolOptions::default(),
			read_preference:         ReadPreference::default(),
			read_concern:            None,
			write_concern:           None
		}
	}
}

impl ClientOptions {
	/// The topology type the coordinator starts out in.
	pub fn initial_topology_type(&self) -> TopologyType {
		if self.load_balanced {
			TopologyType::LoadBalanced
		} else if self.direct_connection {
			TopologyType::Single
		} else if self.replica_set.is_some() {
			TopologyType::ReplicaSetNoPrimary
		} else {
			TopologyType::Unknown
		}
	}

	/// Checks configuration bounds. Called by `Client::new`, never retried.
	pub fn validate(&self) -> Result<()> {
		if self.hosts.is_empty() {
			return Err(Error::InvalidArgument("at least one host is required".to_string()));
		}

		let pool = &self.pool_options;

		if pool.max_pool_size == 0 {
			return Err(Error::InvalidArgument("maxPoolSize must be positive".to_string()));
		}

		if pool.max_pool_size > MAX_POOL_SIZE_CEILING {
			return Err(Error::InvalidArgument(format!(
				"maxPoolSize {} exceeds the ceiling of {}", pool.max_pool_size, MAX_POOL_SIZE_CEILING)));
		}

		if pool.min_pool_size > pool.max_pool_size {
			return Err(Error::InvalidArgument(format!(
				"minPoolSize {} exceeds maxPoolSize {}", pool.min_pool_size, pool.max_pool_size)));
		}

		if self.direct_connection && self.hosts.len() > 1 {
			return Err(Error::InvalidArgument("directConnection requires a single host".to_string()));
		}

		if self.load_balanced && (self.direct_connection || self.replica_set.is_some()) {
			return Err(Error::InvalidArgument(
				"loadBalanced cannot be combined with directConnection or replicaSet".to_string()));
		}

		self.read_preference.validate()
	}
}

#[derive(Debug)]
pub enum ClientOptionsParseError {
	InvalidScheme,
	InvalidHost(String),
	InvalidKey(String),
	InvalidValue { key: &'static str, val: String }
}

impl From<(&'static str, String)> for ClientOptionsParseError {
	fn from((key, val): (&'static str, String)) -> Self {
		Self::InvalidValue { key, val }
	}
}

impl FromStr for ClientOptions {
	type Err = Error;

	fn from_str(mut s: &str) -> Result<Self> {
		fn millis(key: &'static str, value: &str) -> std::result::Result<Duration, ClientOptionsParseError> {
			value.parse()
				.map(Duration::from_millis)
				.map_err(|_| ClientOptionsParseError::from((key, value.to_string())))
		}

		fn size(key: &'static str, value: &str) -> std::result::Result<usize, ClientOptionsParseError> {
			// negative sizes are rejected here, range checks happen in validate()
			value.parse()
				.map_err(|_| ClientOptionsParseError::from((key, value.to_string())))
		}

		let mut self_ = Self::default();

		if !s.starts_with("mongodb://") {
			return Err(Error::InvalidOptions(ClientOptionsParseError::InvalidScheme));
		}

		s = s.trim_start_matches("mongodb://");

		// credentials are the auth collaborator's concern, skip them
		if let Some(i) = s.find('@') {
			s = &s[i + 1..];
		}

		let i = s.find('/').unwrap_or_else(|| s.len());

		// options require the path separator, `host?k=v` is not a host name
		if s[..i].contains('?') {
			return Err(Error::InvalidOptions(ClientOptionsParseError::InvalidHost(s[..i].to_string())));
		}

		self_.hosts = s[..i].split(',')
			.map(str::parse)
			.collect::<Result<_>>()?;

		if i == s.len() { return Ok(self_); }

		s = &s[i + 1..];
		let i = s.find('?').unwrap_or_else(|| s.len());
		s = &s[(i + 1).min(s.len())..];

		if s.is_empty() { return Ok(self_); }

		s.split('&').map(|s| {
			let i = s.find('=').unwrap_or_else(|| s.len());
			(&s[..i], &s[(i + 1).min(s.len())..])
		}).try_for_each(|(key, value)| Ok::<_, ClientOptionsParseError>(match key {
			"appname"                  => self_.appname = Some(value.to_string()),
			"directConnection"         => self_.direct_connection = value == "true",
			"heartbeatFrequencyMS"     => self_.server_selection_config.heartbeat_frequency = millis("heartbeatFrequencyMS", value)?,
			"journal"                  => self_.write_concern
				.get_or_insert_with(WriteConcern::default).journal = Some(value == "true"),
			"loadBalanced"             => self_.load_balanced = value == "true",
			"localThresholdMS"         => self_.server_selection_config.local_threshold = millis("localThresholdMS", value)?,
			"maxIdleTimeMS"            => self_.pool_options.max_idle_time = millis("maxIdleTimeMS", value)?,
			"maxPoolSize"              => self_.pool_options.max_pool_size = size("maxPoolSize", value)?,
			"maxStalenessSeconds"      => self_.read_preference.max_staleness_seconds = Some(value.parse()
				.map_err(|_| ClientOptionsParseError::from(("maxStalenessSeconds", value.to_string())))?),
			"minPoolSize"              => self_.pool_options.min_pool_size = size("minPoolSize", value)?,
			"readConcernLevel"         => self_.read_concern
				.get_or_insert_with(ReadConcern::default).level = Some(value.parse()
				.map_err(|_| ClientOptionsParseError::from(("readConcernLevel", value.to_string())))?),
			"readPreference"           => self_.read_preference.mode = value.parse()
				.map_err(|_| ClientOptionsParseError::from(("readPreference", value.to_string())))?,
			"readPreferenceTags"       => self_.read_preference.tag_sets.push(value.split(',')
				.filter(|s| !s.is_empty())
				.map(|s| {
					let i = s.find(':').unwrap_or_else(|| s.len());
					(s[..i].to_string(), s[(i + 1).min(s.len())..].to_string())
				}).collect()),
			"replicaSet"               => self_.replica_set = Some(value.to_string()),
			"retryReads"               => self_.retry_reads = value == "true",
			"retryWrites"              => self_.retry_writes = value == "true",
			"serverSelectionTimeoutMS" => self_.server_selection_config.server_selection_timeout = millis("serverSelectionTimeoutMS", value)?,
			"waitQueueTimeoutMS"       => self_.pool_options.wait_queue_timeout = millis("waitQueueTimeoutMS", value)?,
			"w"                        => self_.write_concern
				.get_or_insert_with(WriteConcern::default).w = Some(value.parse()
				.map_err(|_| ClientOptionsParseError::from(("w", value.to_string())))?),
			"wTimeoutMS"               => self_.write_concern
				.get_or_insert_with(WriteConcern::default).w_timeout_ms = Some(value.parse()
				.map_err(|_| ClientOptionsParseError::from(("wTimeoutMS", value.to_string())))?),
			key => return Err(ClientOptionsParseError::InvalidKey(key.to_string()))
		}))?;

		Ok(self_)
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionPoolOptions {
	/// Upper bound on checked-out plus idle connections. Must be positive.
	pub max_pool_size:      usize,
	/// Target the pool fills up to opportunistically.
	pub min_pool_size:      usize,
	/// Idle connections older than this are closed on checkout. Zero disables.
	pub max_idle_time:      Duration,
	/// How long a checkout waits for a connection before failing.
	pub wait_queue_timeout: Duration
}

impl Default for ConnectionPoolOptions {
	fn default() -> Self {
		Self {
			max_pool_size:      DEFAULT_MAX_POOL_SIZE,
			min_pool_size:      DEFAULT_MIN_POOL_SIZE,
			max_idle_time:      DEFAULT_MAX_IDLE_TIME,
			wait_queue_timeout: DEFAULT_WAIT_QUEUE_TIMEOUT
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerSelectionConfig {
	pub local_threshold:          Duration,
	pub server_selection_timeout: Duration,
	pub heartbeat_frequency:      Duration
}

impl Default for ServerSelectionConfig {
	fn default() -> Self {
		Self {
			local_threshold:          DEFAULT_LOCAL_THRESHOLD,
			server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
			heartbeat_frequency:      DEFAULT_HEARTBEAT_FREQUENCY
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReadPreference {
	pub mode:                  ReadPreferenceMode,
	pub max_staleness_seconds: Option<i64>,
	pub tag_sets:              Vec<HashMap<String, String>>
}

impl Default for ReadPreference {
	fn default() -> Self {
		Self {
			mode:                  ReadPreferenceMode::Primary,
			max_staleness_seconds: None,
			tag_sets:              Vec::new()
		}
	}
}

impl ReadPreference {
	pub fn secondary() -> Self {
		Self { mode: ReadPreferenceMode::Secondary, ..Self::default() }
	}

	pub fn nearest() -> Self {
		Self { mode: ReadPreferenceMode::Nearest, ..Self::default() }
	}

	pub fn validate(&self) -> Result<()> {
		if self.mode == ReadPreferenceMode::Primary {
			if !self.tag_sets.is_empty() {
				return Err(Error::InvalidArgument("read preference primary does not accept tag sets".to_string()));
			}
			if self.max_staleness_seconds.is_some() {
				return Err(Error::InvalidArgument("read preference primary does not accept maxStalenessSeconds".to_string()));
			}
		}

		match self.max_staleness_seconds {
			Some(v) if v < MIN_MAX_STALENESS_SECONDS => Err(Error::InvalidArgument(format!(
				"maxStalenessSeconds must be at least {}, got {}", MIN_MAX_STALENESS_SECONDS, v))),
			_ => Ok(())
		}
	}
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum ReadPreferenceMode {
	Primary,
	PrimaryPreferred,
	Secondary,
	SecondaryPreferred,
	Nearest
}

impl FromStr for ReadPreferenceMode {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"primary"            => Self::Primary,
			"primaryPreferred"   => Self::PrimaryPreferred,
			"secondary"          => Self::Secondary,
			"secondaryPreferred" => Self::SecondaryPreferred,
			"nearest"            => Self::Nearest,
			_ => return Err(())
		})
	}
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReadConcern {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub level: Option<ReadConcernLevel>
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadConcernLevel {
	Local,
	Majority,
	Linearizable,
	Available,
	Snapshot
}

impl FromStr for ReadConcernLevel {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"local"        => Self::Local,
			"majority"     => Self::Majority,
			"linearizable" => Self::Linearizable,
			"available"    => Self::Available,
			"snapshot"     => Self::Snapshot,
			_ => return Err(())
		})
	}
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct WriteConcern {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub w:            Option<W>,
	#[serde(skip_serializing_if = "Option::is_none", rename = "j")]
	pub journal:      Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none", rename = "wtimeout")]
	pub w_timeout_ms: Option<i64>
}

/// The `w` component of a write concern: a node count, `"majority"`, or a
/// custom write-concern tag defined in the replica-set configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum W {
	Nodes(i32),
	Majority,
	Custom(String)
}

impl FromStr for W {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"majority" => Self::Majority,
			_ => match s.parse() {
				Ok(n) if n >= 0 => Self::Nodes(n),
				Ok(_)  => return Err(()),
				Err(_) => Self::Custom(s.to_string())
			}
		})
	}
}

impl Serialize for W {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		match self {
			Self::Nodes(n)  => serializer.serialize_i32(*n),
			Self::Majority  => serializer.serialize_str("majority"),
			Self::Custom(s) => serializer.serialize_str(s)
		}
	}
}

impl<'de> Deserialize<'de> for W {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		struct V;

		impl<'de> serde::de::Visitor<'de> for V {
			type Value = W;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("an integer or string")
			}

			fn visit_i32<E: serde::de::Error>(self, v: i32) -> std::result::Result<W, E> {
				Ok(W::Nodes(v))
			}

			fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<W, E> {
				Ok(W::Nodes(v as i32))
			}

			fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<W, E> {
				Ok(W::Nodes(v as i32))
			}

			fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<W, E> {
				Ok(match v {
					"majority" => W::Majority,
					_ => W::Custom(v.to_string())
				})
			}

			fn visit_string<E: serde::de::Error>(self, v: String) -> std::result::Result<W, E> {
				self.visit_str(&v)
			}
		}

		deserializer.deserialize_any(V)
	}
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// Malformed configuration, raised at construction and never retried.
	InvalidArgument(String),
	InvalidOptions(ClientOptionsParseError),
	/// No connection became available within the wait budget.
	PoolTimeout { address: ServerAddress, waited: Duration },
	/// Checkout attempted on a closing or closed pool.
	PoolClosed(ServerAddress),
	/// Operation attempted after `Client::close`.
	ClientClosed,
	/// No eligible server was found within the selection timeout.
	ServerSelectionTimeout(String),
	/// Transport-level failure. Clears the affected pool and expedites the
	/// server's next heartbeat.
	Io(std::io::Error),
	/// A server-reported command failure.
	Operation { code: ErrorCode, message: String },
	/// An invalid transaction state transition.
	Transaction(String),
	/// A lock was poisoned by a panicking holder.
	Sync,
	Encode(document::se::Error),
	Decode(document::de::Error)
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		<Self as fmt::Debug>::fmt(self, f)
	}
}

impl std::error::Error for Error {}

impl Error {
	pub(crate) fn network(message: &str) -> Self {
		Self::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
	}

	/// Whether the failure may be resolved by exactly one retry against a
	/// freshly selected server.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::Io(_) => true,
			Self::Operation { code, .. } => code.is_retryable(),
			_ => false
		}
	}

	/// "not writable primary" class errors, the server is no longer a primary.
	pub fn is_not_primary(&self) -> bool {
		matches!(self, Self::Operation { code, .. } if code.is_not_primary())
	}

	/// "node is recovering" class errors, the server is shutting down or
	/// catching up and cannot serve operations.
	pub fn is_recovering(&self) -> bool {
		matches!(self, Self::Operation { code, .. } if code.is_recovering())
	}

	/// Whether this failure indicates the server state is stale and its pool
	/// must be cleared.
	pub(crate) fn invalidates_server(&self) -> bool {
		matches!(self, Self::Io(_)) || self.is_not_primary() || self.is_recovering()
	}
}

impl From<ClientOptionsParseError> for Error {
	fn from(e: ClientOptionsParseError) -> Self {
		Self::InvalidOptions(e)
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Self::Io(e)
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_: std::sync::PoisonError<T>) -> Self {
		Self::Sync
	}
}

impl From<document::se::Error> for Error {
	fn from(e: document::se::Error) -> Self {
		Self::Encode(e)
	}
}

impl From<document::de::Error> for Error {
	fn from(e: document::de::Error) -> Self {
		Self::Decode(e)
	}
}

/// The server error codes the core classifies. Everything else is carried
/// through as `Other` and propagated unchanged.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
	HostUnreachable,                  // 6
	HostNotFound,                     // 7
	CursorNotFound,                   // 43
	MaxTimeMsExpired,                 // 50
	WriteConcernFailed,               // 64
	NetworkTimeout,                   // 89
	ShutdownInProgress,               // 91
	PrimarySteppedDown,               // 189
	NoSuchTransaction,                // 251
	ExceededTimeLimit,                // 262
	SocketException,                  // 9001
	NotWritablePrimary,               // 10107
	InterruptedAtShutdown,            // 11600
	InterruptedDueToReplStateChange,  // 11602
	NotPrimaryNoSecondaryOk,          // 13435
	NotPrimaryOrSecondary,            // 13436
	Other(i32)
}

impl ErrorCode {
	pub fn code(self) -> i32 {
		match self {
			Self::HostUnreachable                 => 6,
			Self::HostNotFound                    => 7,
			Self::CursorNotFound                  => 43,
			Self::MaxTimeMsExpired                => 50,
			Self::WriteConcernFailed              => 64,
			Self::NetworkTimeout                  => 89,
			Self::ShutdownInProgress              => 91,
			Self::PrimarySteppedDown              => 189,
			Self::NoSuchTransaction               => 251,
			Self::ExceededTimeLimit               => 262,
			Self::SocketException                 => 9001,
			Self::NotWritablePrimary              => 10107,
			Self::InterruptedAtShutdown           => 11600,
			Self::InterruptedDueToReplStateChange => 11602,
			Self::NotPrimaryNoSecondaryOk         => 13435,
			Self::NotPrimaryOrSecondary           => 13436,
			Self::Other(code)                     => code
		}
	}

	/// The fixed retryable set of the retryable reads/writes specifications.
	pub fn is_retryable(self) -> bool {
		matches!(self,
			Self::HostUnreachable
			| Self::HostNotFound
			| Self::NetworkTimeout
			| Self::ShutdownInProgress
			| Self::PrimarySteppedDown
			| Self::ExceededTimeLimit
			| Self::SocketException
			| Self::NotWritablePrimary
			| Self::InterruptedAtShutdown
			| Self::InterruptedDueToReplStateChange
			| Self::NotPrimaryNoSecondaryOk
			| Self::NotPrimaryOrSecondary)
	}

	pub fn is_not_primary(self) -> bool {
		matches!(self,
			Self::PrimarySteppedDown
			| Self::NotWritablePrimary
			| Self::NotPrimaryNoSecondaryOk
			| Self::NotPrimaryOrSecondary)
	}

	pub fn is_recovering(self) -> bool {
		matches!(self,
			Self::ShutdownInProgress
			| Self::InterruptedAtShutdown
			| Self::InterruptedDueToReplStateChange)
	}
}

impl From<i32> for ErrorCode {
	fn from(v: i32) -> Self {
		match v {
			6     => Self::HostUnreachable,
			7     => Self::HostNotFound,
			43    => Self::CursorNotFound,
			50    => Self::MaxTimeMsExpired,
			64    => Self::WriteConcernFailed,
			89    => Self::NetworkTimeout,
			91    => Self::ShutdownInProgress,
			189   => Self::PrimarySteppedDown,
			251   => Self::NoSuchTransaction,
			262   => Self::ExceededTimeLimit,
			9001  => Self::SocketException,
			10107 => Self::NotWritablePrimary,
			11600 => Self::InterruptedAtShutdown,
			11602 => Self::InterruptedDueToReplStateChange,
			13435 => Self::NotPrimaryNoSecondaryOk,
			13436 => Self::NotPrimaryOrSecondary,
			code  => Self::Other(code)
		}
	}
}

/// The fields shared by every command reply.
#[derive(Debug, Deserialize)]
pub struct GenericReply {
	pub ok:     f64,
	pub code:   Option<i32>,
	pub errmsg: Option<String>
}

impl From<GenericReply> for Error {
	fn from(reply: GenericReply) -> Self {
		Self::Operation {
			code:    reply.code.unwrap_or(8).into(),
			message: reply.errmsg.unwrap_or_default()
		}
	}
}

#[cfg(test)]
mod tests {
	use {super::*, crate::document::Document};

	#[test]
	fn parse_uri_options() {
		let options = ClientOptions::from_str(
			"mongodb://a:27017,b:27018/?maxPoolSize=5&minPoolSize=2&heartbeatFrequencyMS=500\
			&serverSelectionTimeoutMS=1000&retryWrites=false&retryReads=true\
			&readConcernLevel=majority&w=majority&journal=true&wTimeoutMS=200\
			&readPreference=secondary&readPreferenceTags=dc:east,rack:1&maxStalenessSeconds=120\
			&replicaSet=rs0&localThresholdMS=30&waitQueueTimeoutMS=250"
		).unwrap();

		assert_eq!(options.hosts, vec![ServerAddress::new("a", 27017), ServerAddress::new("b", 27018)]);
		assert_eq!(options.pool_options.max_pool_size, 5);
		assert_eq!(options.pool_options.min_pool_size, 2);
		assert_eq!(options.pool_options.wait_queue_timeout, Duration::from_millis(250));
		assert_eq!(options.server_selection_config.heartbeat_frequency, Duration::from_millis(500));
		assert_eq!(options.server_selection_config.server_selection_timeout, Duration::from_secs(1));
		assert_eq!(options.server_selection_config.local_threshold, Duration::from_millis(30));
		assert!(!options.retry_writes);
		assert!(options.retry_reads);
		assert_eq!(options.replica_set.as_deref(), Some("rs0"));
		assert_eq!(options.read_concern, Some(ReadConcern { level: Some(ReadConcernLevel::Majority) }));
		assert_eq!(options.write_concern, Some(WriteConcern {
			w:            Some(W::Majority),
			journal:      Some(true),
			w_timeout_ms: Some(200)
		}));
		assert_eq!(options.read_preference.mode, ReadPreferenceMode::Secondary);
		assert_eq!(options.read_preference.max_staleness_seconds, Some(120));
		assert_eq!(options.read_preference.tag_sets.len(), 1);
		assert_eq!(options.read_preference.tag_sets[0].get("dc").map(String::as_str), Some("east"));

		options.validate().unwrap();
	}

	#[test]
	fn parse_rejects_bad_input() {
		assert!(matches!(
			ClientOptions::from_str("http://localhost"),
			Err(Error::InvalidOptions(ClientOptionsParseError::InvalidScheme))));
		assert!(matches!(
			ClientOptions::from_str("mongodb://localhost/?bogusOption=1"),
			Err(Error::InvalidOptions(ClientOptionsParseError::InvalidKey(_)))));
		assert!(matches!(
			ClientOptions::from_str("mongodb://localhost?maxPoolSize=2"),
			Err(Error::InvalidOptions(ClientOptionsParseError::InvalidHost(_)))));
		assert!(matches!(
			ClientOptions::from_str("mongodb://localhost/?maxPoolSize=-3"),
			Err(Error::InvalidOptions(ClientOptionsParseError::InvalidValue { key: "maxPoolSize", .. }))));
		assert!(matches!(
			ClientOptions::from_str("mongodb://localhost:notaport"),
			Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn validate_rejects_bad_sizes() {
		let parse = |uri: &str| ClientOptions::from_str(uri).unwrap().validate();

		assert!(matches!(parse("mongodb://localhost/?maxPoolSize=0"), Err(Error::InvalidArgument(_))));
		assert!(matches!(parse("mongodb://localhost/?maxPoolSize=9999999999"), Err(Error::InvalidArgument(_))));
		assert!(matches!(parse("mongodb://localhost/?maxPoolSize=2&minPoolSize=3"), Err(Error::InvalidArgument(_))));
		assert!(matches!(parse("mongodb://localhost/?maxStalenessSeconds=10&readPreference=secondary"),
			Err(Error::InvalidArgument(_))));
		assert!(matches!(parse("mongodb://localhost/?readPreferenceTags=dc:east"), Err(Error::InvalidArgument(_))));
		parse("mongodb://localhost").unwrap();
	}

	#[test]
	fn server_address_normalization() {
		let a: ServerAddress = "LocalHost:27017".parse().unwrap();
		let b: ServerAddress = "localhost".parse().unwrap();
		assert_eq!(a, b);
		assert_eq!(a.to_string(), "localhost:27017");
	}

	#[test]
	fn read_concern_round_trip() {
		for level in &[
			None,
			Some(ReadConcernLevel::Local),
			Some(ReadConcernLevel::Majority),
			Some(ReadConcernLevel::Linearizable),
			Some(ReadConcernLevel::Available),
			Some(ReadConcernLevel::Snapshot)
		] {
			let concern = ReadConcern { level: *level };
			let doc = Document::from(&concern).unwrap();
			assert_eq!(doc.deserialize::<ReadConcern>().unwrap(), concern);
		}
	}

	#[test]
	fn write_concern_round_trip() {
		for w in &[
			None,
			Some(W::Nodes(0)),
			Some(W::Nodes(3)),
			Some(W::Majority),
			Some(W::Custom("ssd".to_string()))
		] {
			let concern = WriteConcern {
				w:            w.clone(),
				journal:      Some(true),
				w_timeout_ms: Some(100)
			};
			let doc = Document::from(&concern).unwrap();
			assert_eq!(doc.deserialize::<WriteConcern>().unwrap(), concern);
		}
	}

	#[test]
	fn error_code_classification() {
		for code in &[6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436] {
			assert!(ErrorCode::from(*code).is_retryable(), "code {} must be retryable", code);
			assert_eq!(ErrorCode::from(*code).code(), *code);
		}

		for code in &[0, 11000, 50, 64, 43, 251] {
			assert!(!ErrorCode::from(*code).is_retryable(), "code {} must not be retryable", code);
		}

		assert!(ErrorCode::from(10107).is_not_primary());
		assert!(ErrorCode::from(11600).is_recovering());
		assert!(Error::network("reset").is_retryable());
	}
}
