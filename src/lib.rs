pub mod bus;
pub mod config;
pub mod enrich;
pub mod fetch;
pub mod flatten;
pub mod model;
pub mod pipeline;
pub mod sink;
pub mod stats;
pub mod stops;
pub mod window;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
