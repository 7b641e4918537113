pub mod checkers;
pub mod compiler;
pub mod domain;
pub mod limits;
pub mod notify;
pub mod pipeline;
pub mod runner;
pub mod score;
pub mod streams;
pub mod traits;
