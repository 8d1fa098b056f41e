//! VPN server selection
//!
//! Picks a public relay to connect to and fails over when it does not hold.
//!
//! ## Architecture
//!
//! - candidate.rs: Candidate record and success history
//! - parser.rs: feed rows to candidates (legacy and compact layouts)
//! - prober.rs: concurrent TCP connect latency probing
//! - scorer.rs: quality scoring and ranking
//! - store.rs: persisted raw/scored lists, fetch timestamp, success history
//! - servers.rs: feed fetching with cache fallback
//! - tunnel.rs: tunnel subsystem and connectivity seams
//! - connection.rs: connect/failover state machine and idle refresh

pub mod candidate;
pub mod connection;
pub mod parser;
pub mod prober;
pub mod scorer;
pub mod servers;
pub mod store;
pub mod tunnel;

pub use candidate::{Candidate, CandidateSet, SuccessHistory};
pub use connection::{
    Collaborators, ConnectionState, IdleRefreshHandle, SessionFailoverState, VpnConnection,
};
pub use parser::{CandidateParser, FeedLayout, ParseReport};
pub use prober::{Probe, ProbeProfile, ProbeStream, ProbeSummary, ProbeUpdate, Prober, TcpProbe};
pub use scorer::{QualityScorer, ScoringStrategy, ThroughputPerSession, WeightedComposite};
pub use servers::{FeedSource, HttpFeed, ServerList, ServerListSource};
pub use store::{CandidateStore, Clock, FileStore, KeyValueStore, MemoryStore, SystemClock};
pub use tunnel::{ConnectivityCheck, Credentials, RouteConnectivity, TunnelController, TunnelStatus};
