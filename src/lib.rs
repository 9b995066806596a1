pub mod client_config;
pub mod connector;
pub mod half_close;
pub mod relay;
