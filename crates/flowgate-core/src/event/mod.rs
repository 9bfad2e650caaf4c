//! In-process event distribution.

pub mod bus;
