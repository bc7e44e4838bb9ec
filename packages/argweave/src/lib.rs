pub mod arg;
pub mod constants;
pub mod hmm;
pub mod io;
pub mod model;
pub mod sample;
pub mod utils;

#[cfg(test)]
mod tests {
  use crate::utils::global_init::global_init;
  use ctor::ctor;

  #[ctor]
  fn init() {
    global_init();
  }
}
