//! HTTP handlers. Every route except `/health` sits behind the tenant
//! pipeline and reads its organization from the resolved [`TenantContext`].
//!
//! [`TenantContext`]: crate::models::TenantContext

pub mod audit;
pub mod health;
pub mod isolation;
pub mod members;

pub use audit::*;
pub use health::*;
pub use isolation::*;
pub use members::*;
