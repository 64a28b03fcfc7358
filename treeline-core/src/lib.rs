#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod channels;
pub mod dispatcher;
pub mod events;
pub mod log;
pub mod planner;
pub mod results;
pub mod routing;
