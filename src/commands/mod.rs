// RelayGate Commands
// Operator utility layer

mod system;

pub use system::*;
