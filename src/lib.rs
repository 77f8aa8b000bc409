pub mod gc;
pub mod table;
pub mod value;
pub mod vm;
