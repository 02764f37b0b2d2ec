pub mod config;
pub mod error;
pub mod fetch;
pub mod matching;
pub mod metrics;
pub mod output;
pub mod parser;
pub mod reconcile;
pub mod replacement;
pub mod resolver;
pub mod restore;
pub mod stats;
pub mod store;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
