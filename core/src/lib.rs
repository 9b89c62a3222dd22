pub mod bus;
pub mod ncr;
pub mod sim;
pub mod types;
