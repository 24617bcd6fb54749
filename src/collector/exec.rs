//! External command collectors.
//!
//! - [`ExecCollector`]: forwards a subprocess's stdout lines

mod collector;

pub use collector::{DISABLE_EXIT_CODE, ExecCollector, ExecConfig};
