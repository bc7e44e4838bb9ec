pub mod arg;
pub mod nwk;
