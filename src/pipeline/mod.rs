pub mod dispatch;
pub mod ports;
pub mod rendezvous;
pub mod settings;
pub mod state;
