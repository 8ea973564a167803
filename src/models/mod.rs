pub mod commission;
pub mod delivery;
pub mod event;
pub mod location;
pub mod offer;
pub mod stop;
