pub mod gpio;
pub mod live_data;
