pub mod incoming_relay;
pub mod outgoing_relay;
