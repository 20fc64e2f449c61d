pub mod protocol;
pub mod serialisable;
pub mod states;
pub mod tube_name;
