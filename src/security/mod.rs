pub mod env_filter;
pub mod secrets;
