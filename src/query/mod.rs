pub mod builder;

pub use builder::{OrderQuery, OrderRow};
