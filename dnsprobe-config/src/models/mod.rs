pub mod domains;
pub mod probe;
