#![forbid(unsafe_code)]

pub mod assertion;
pub mod clock;
pub mod orderkey;
pub mod path;

pub use assertion::{Assertion, AttrValue};
pub use clock::{BEGINNING_OF_TIME, Clock, ClockConfig, ClockError, END_OF_TIME, Timestamp};
pub use orderkey::OrderKeyError;
pub use path::{AncestorPath, MAX_DEPTH, NodeId, PathError, ROOT_ID};
