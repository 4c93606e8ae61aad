// RelayGate Models
// Data structures for the application

mod destination;
mod egress;

pub use destination::*;
pub use egress::*;
