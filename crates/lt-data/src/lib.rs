pub mod trial_log;

pub use trial_log::*;
