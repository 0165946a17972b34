//! Resource Schema Module
//!
//! Declarative resource type schemas with inheritance, attribute and
//! statistic definitions, alert conditions and identifier strategies.

pub mod attributes;
pub mod base;
pub mod conditions;
pub mod identifier;
pub mod resource_type;
pub mod statistics;

pub use attributes::*;
pub use conditions::*;
pub use identifier::*;
pub use resource_type::*;
pub use statistics::*;
