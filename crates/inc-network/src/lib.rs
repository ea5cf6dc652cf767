pub mod frame;
pub mod tcp;
pub mod transport;
