pub mod agent;
pub mod config;
pub mod export;
pub mod icmp;
pub mod ifstats;
pub mod metric;
pub mod normalize;
pub mod pf;
pub mod sink;
