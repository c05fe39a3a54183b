//! Command implementations

pub mod defragment;
pub mod explode;
pub mod extract;
pub mod implode;
pub mod info;
pub mod open;
pub mod search;
pub mod validate;
