pub mod exercise;
pub mod teacher;
pub mod together;

mod helper;
