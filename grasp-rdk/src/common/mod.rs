pub mod config;
pub mod grasp;
pub mod math_utils;
pub mod normalizer;
pub mod point_cloud;
pub mod prerequisites;

#[cfg(feature = "server")]
pub mod errors;
#[cfg(feature = "server")]
pub mod executor;
#[cfg(feature = "server")]
pub mod handler;

#[cfg(feature = "client")]
pub mod client;
