pub mod servers;
pub mod socket_guard;
