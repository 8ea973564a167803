pub mod commission;
pub mod offer;
pub mod progression;
pub mod reconcile;
pub mod sequencer;
pub mod session;
pub mod watch;
