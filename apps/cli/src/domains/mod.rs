pub mod book;
pub mod collection;
