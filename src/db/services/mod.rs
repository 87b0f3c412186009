pub mod account_service;
pub mod server_service;
pub mod traffic_service;
