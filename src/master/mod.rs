pub mod copies_calculator;
pub mod goal_cache;
pub mod goal_config;
pub mod health;
pub mod server_chooser;
