// Consensus Core
//
// Message protocol, pure role logic, the Outcome value object, the
// leader's shipping state, and the driver machine that ties them to
// durable storage and the network boundary.

pub mod codec;
pub mod machine;
pub mod message;
pub mod outcome;
pub mod roles;
pub mod shipping;

pub use machine::{NodeHealth, RaftHandle, RaftMachine, Status, Ticket};
pub use message::{Envelope, RaftMessage};
pub use outcome::{LogOp, Outbound, Outcome};
pub use roles::{RaftView, Role, RoleState};
pub use shipping::{FollowerProgress, FollowerStates};
