//! Evaluation of feature flag expressions.
//!
//! A flag is a namespaced, named [Expr] tree. [evaluate] fetches a flag from a [Store] and decides
//! it for an identity value; the same identity always gets the same answer while the flag is
//! unchanged. Percentage rollouts bucket identities with [bucket()], and `ref` nodes defer to other
//! flags as configured by [RefResolution].

mod bucket;
mod eval;
mod expr;
mod flag;
mod store;
mod test_common;
mod util;

pub use bucket::*;
pub use eval::*;
pub use expr::*;
pub use flag::*;
pub use store::*;
