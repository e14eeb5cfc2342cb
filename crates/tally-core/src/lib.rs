//! Core domain logic for tally: expression decomposition into binary-task
//! graphs, pull-based task dispatch, and the authentication primitives used
//! by the HTTP front door.

pub mod auth;
pub mod dispatch;
pub mod expr;
pub mod token;
