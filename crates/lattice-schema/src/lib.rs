//! Validation schema handling for route compilation.
//!
//! Route configurations carry a JSON-Schema-like validation object. Before a
//! route can dispatch, that object goes through three transformations:
//!
//! 1. **Merging**: the user schema is layered over the strict-object default,
//!    and inherited parent fragments are layered under the route's own values
//!    ([`deep_merge`]).
//! 2. **Custom-type resolution**: server defaults may declare named type
//!    fragments (`"message"`, `"stringOrNull"`) that other schemas reference
//!    by name in their `type` keyword. [`resolve`] rewrites every reference to
//!    the underlying standard types, carrying sibling keywords along. The
//!    resolution is cycle-tolerant: malformed cyclic definitions stop making
//!    progress and leave the residual name in place for the compiler to
//!    reject.
//! 3. **Compilation**: [`Validator::compile`] turns the resolved object into
//!    a predicate producing human-readable error descriptions.

mod merge;
mod resolve;
mod validator;

pub use merge::{deep_merge, strict_object_default};
pub use resolve::{resolve, resolve_self};
pub use validator::{SchemaError, ValidationErrors, Validator};
