//! # Stage Construction
//!
//! Containers that assign stage ids and persist a request's stages, plus
//! multi-step builders that assemble well-known operations out of stages.

pub mod container;
pub mod identity;

pub use container::{OrderedRequestStageContainer, RequestStageContainer};
pub use identity::{Component, DeleteIdentityHandler, DeleteIdentityParams, KdcType};
