pub mod compiler;
pub mod notifier;
pub mod runner;
pub mod sandbox;
