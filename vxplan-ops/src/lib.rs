//! Operator families for vxplan.
//!
//! Each module declares its variant families and its [`Operator`] and
//! submits both to `inventory`; linking this crate is enough to make them
//! visible to [`Resolver::from_inventory`].
//!
//! [`Operator`]: vxplan::Operator

pub mod bucketize;
pub mod clip;
pub mod cumsum;
pub mod scatter_nd_update;

use vxplan::{Resolver, ResolverConfig, Result};

pub use scatter_nd_update::Reduction;

/// Resolver over every family and operator in this crate.
///
/// # Errors
/// Returns [`vxplan::Error::Internal`] if a family fails its self-check
pub fn resolver(config: ResolverConfig) -> Result<Resolver> {
    Resolver::from_inventory(config)
}
