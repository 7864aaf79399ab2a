pub mod delivery_tracker;
pub mod node;
pub mod node_config;
pub mod node_events;
pub mod receive_endpoint;
pub mod retry_driver;
pub mod send_endpoint;
