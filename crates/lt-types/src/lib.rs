pub mod errors;
pub mod experiment;
pub mod hyperparams;

pub use errors::*;
pub use experiment::*;
pub use hyperparams::*;
