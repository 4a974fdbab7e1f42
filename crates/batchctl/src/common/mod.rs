pub mod arraydef;
pub mod error;
pub mod fsutils;
pub mod nodelist;
pub mod parser;
pub mod serialization;
pub mod setup;
pub mod size;
pub mod timeutils;
