//! Resource Graph Module
//!
//! Resource instances with dirty tracking, and the identity index used to
//! resolve plugin reports to cached instances.

pub mod index;
pub mod resource;

pub use index::*;
pub use resource::*;
