pub mod emit;
pub mod forward;
pub mod recomb;
pub mod states;
pub mod trans;
