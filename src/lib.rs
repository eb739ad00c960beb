pub mod config;
pub mod io;
pub mod logging;
pub mod output;
pub mod persistence;
pub mod time_util;
