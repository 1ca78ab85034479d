mod attribute_range;
mod batch;
mod command;
mod core;
mod ops;
mod plugin;
mod schema;

pub use crate::attribute_range::*;
pub use crate::batch::*;
pub use crate::command::*;
pub use crate::core::*;
pub use crate::ops::*;
pub use crate::plugin::*;
pub use crate::schema::*;
