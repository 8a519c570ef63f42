pub mod logger;
pub mod suggest;
