//! Network implementations of the rollout engine's collaborator traits.
//!
//! - [`GraphqlStore`] reads artifacts from the source-of-truth store over
//!   its branch-scoped GraphQL API and object-store endpoint.
//! - [`GatewayChannel`] replaces device configuration through a JSON
//!   management gateway listening on each device.

pub mod gateway;
pub mod graphql;

pub use gateway::GatewayChannel;
pub use graphql::GraphqlStore;
