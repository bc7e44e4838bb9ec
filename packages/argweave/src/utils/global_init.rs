use env_logger::Env;
use log::LevelFilter;
use std::io::Write;

pub fn setup_logger(filter_level: LevelFilter) {
  env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
    .filter_level(filter_level)
    .format(|buf, record| {
      let mut level_str = record.level().to_string();
      level_str.truncate(1);
      writeln!(buf, "[{level_str}] {}", record.args())?;
      Ok(())
    })
    .try_init()
    .ok();
}

pub fn global_init() {
  color_eyre::install().ok();
}
