pub mod intake;
pub mod queue;
pub mod routes;
pub mod state;
pub mod stats;
