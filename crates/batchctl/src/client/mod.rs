pub mod cli;
pub mod commands;
pub mod globalsettings;
pub mod output;
