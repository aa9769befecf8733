pub mod debug;
pub mod recommendations;
