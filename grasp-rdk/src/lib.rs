//! Grasp pose detection as a network service.
//!
//! The [`common::handler`] module exposes the HTTP surface that runs an external
//! detector per request, and [`common::client`] is the calling side that uploads
//! point clouds and maps the returned poses back into the caller's frame.
pub mod common;
