//! Core value types for the service runtime: property maps, LDAP-style
//! filters and the identity of the bundles that own or request services.

/// Owning and requesting bundle identity.
pub mod bundle;
/// LDAP-style filter parsing and matching.
pub mod filter;
/// Ordered string property maps and well-known keys.
pub mod properties;

pub use bundle::{EMPTY_BUNDLE_ID, EmptyBundle, ResourceBundle, empty_bundle};
pub use filter::{Filter, FilterError, FilterOperator};
pub use properties::{Properties, keys};
