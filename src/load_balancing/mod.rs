//! Load balancing strategies for distributing dispatches across endpoints.

pub mod balancer;

pub use balancer::{
    balancer_for, LoadBalancer, LoadBalancerStats, LoadBalancingPolicy, RandomBalancer,
    RoundRobinBalancer,
};
