//! Process bootstrap helpers.

pub mod bootstrap;
