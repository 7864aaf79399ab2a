pub mod duplicate_archive;
pub mod message;
pub mod sockets;
