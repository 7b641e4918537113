pub mod errors;
pub mod quota;
pub mod registry;
pub mod service;
pub mod store;
