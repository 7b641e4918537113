pub mod building;
pub mod checking;
pub mod grading;
pub mod interactive;
