pub mod mytime;
