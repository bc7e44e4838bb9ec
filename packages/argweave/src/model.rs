pub mod arg_model;
pub mod population;
pub mod sequences;
pub mod time_grid;
pub mod track;
