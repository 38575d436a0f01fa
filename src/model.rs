pub mod content;
pub mod exercise;
pub mod teacher;
pub mod together;
