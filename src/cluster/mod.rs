// Cluster coordination:
//
// - `registry`: the local view of every configured peer
// - `election`: bully coordinator election
// - `failure`: heartbeat emission and liveness inference
// - `balancer`: peer selection policies for routed queries

pub mod balancer;
pub mod election;
pub mod failure;
pub mod registry;

pub use balancer::{LoadBalancer, LoadStatistics, Strategy};
pub use election::Coordinator;
pub use failure::FailureDetector;
pub use registry::PeerRegistry;
