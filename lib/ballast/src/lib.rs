#![allow(clippy::new_without_default)]

pub mod fs;
pub mod logging;
pub mod time;
